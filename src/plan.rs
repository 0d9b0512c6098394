//! Instance plan builder
//!
//! Expands a validated profile into an ordered list of per-instance launch
//! plans: resolved device grants, prefix directory, window geometry and the
//! merged environment. Building is pure and deterministic — identical
//! inputs yield identical plans — and performs no filesystem writes, so
//! every configuration error is caught before any process side effect.

use crate::inventory::{DeviceClass, DeviceInventory, DeviceNode};
use crate::profile::{Geometry, LaunchMode, Orientation, Player, Profile};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Base port for instances whose player leaves `listen_port` at 0.
pub const BASE_LISTEN_PORT: u16 = 47584;

/// Name of the lock file marking a prefix as in use by a live run.
pub const PREFIX_LOCK_NAME: &str = "prefix.lock";

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("device '{device}' is claimed by both '{first}' and '{second}'")]
    DeviceConflict {
        device: String,
        first: String,
        second: String,
    },

    #[error("no device matches {class} selector '{selector}' for player '{player}'")]
    DeviceNotFound {
        class: DeviceClass,
        selector: String,
        player: String,
    },

    #[error("mode supplies {actual} geometries for {expected} players")]
    GeometryMismatch { expected: usize, actual: usize },

    #[error("prefix '{}' is already in use by another run", .prefix.display())]
    PrefixCollision { prefix: PathBuf },
}

/// Everything needed to materialize and launch one instance.
/// Created here, consumed read-only by the assembler and supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePlan {
    pub ordinal: usize,
    pub player_name: String,
    pub locale: String,
    /// The exact set of device nodes this instance may see. Classes with no
    /// selector contribute nothing (default-deny).
    pub devices: Vec<DeviceNode>,
    pub prefix_dir: PathBuf,
    pub geometry: Geometry,
    /// Merged environment: built-in defaults < profile overrides < player
    /// overrides.
    pub env: BTreeMap<String, String>,
    pub account_id: String,
    pub listen_port: u16,
    /// Fully qualified argument vector for the target executable.
    pub exe_path: PathBuf,
    pub game_args: Vec<String>,
}

impl InstancePlan {
    pub fn grants(&self, class: DeviceClass) -> bool {
        self.devices.iter().any(|node| node.class == class)
    }
}

/// Expands `profile` into one plan per player, in profile order.
///
/// `data_root` is the persistent state root; prefixes land under
/// `<data_root>/prefixes/<game_name>/instance_<n>`.
pub fn build(
    profile: &Profile,
    inventory: &DeviceInventory,
    data_root: &Path,
) -> Result<Vec<InstancePlan>, PlanError> {
    // Selector uniqueness is the unconditional first check; it must fail
    // before any other work happens.
    check_selector_uniqueness(&profile.players)?;

    let assignments = resolve_devices(&profile.players, inventory)?;
    let slots = compute_geometry(&profile.mode, profile.players.len())?;
    let prefixes = derive_prefixes(profile, data_root)?;

    let mut plans = Vec::with_capacity(profile.players.len());
    for (ordinal, player) in profile.players.iter().enumerate() {
        let account_id = player
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}-p{}", profile.game_name, ordinal + 1));

        let listen_port = if player.listen_port == 0 {
            BASE_LISTEN_PORT + ordinal as u16
        } else {
            player.listen_port
        };

        plans.push(InstancePlan {
            ordinal,
            player_name: player.name.clone(),
            locale: player.locale.clone(),
            devices: assignments[ordinal].clone(),
            prefix_dir: prefixes[ordinal].clone(),
            geometry: slots[ordinal],
            env: merge_env(profile, player),
            account_id,
            listen_port,
            exe_path: profile.exe_path.clone(),
            game_args: profile.game_args.clone(),
        });
    }

    log::info!(
        "Built {} instance plans for '{}'",
        plans.len(),
        profile.game_name
    );
    Ok(plans)
}

fn selectors(player: &Player) -> impl Iterator<Item = (DeviceClass, &str)> {
    [
        (DeviceClass::Controller, player.controller.as_deref()),
        (DeviceClass::Mouse, player.mouse.as_deref()),
        (DeviceClass::Keyboard, player.keyboard.as_deref()),
    ]
    .into_iter()
    .filter_map(|(class, selector)| {
        let selector = selector.map(str::trim).filter(|s| !s.is_empty())?;
        Some((class, selector))
    })
}

fn check_selector_uniqueness(players: &[Player]) -> Result<(), PlanError> {
    let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
    for player in players {
        for (_, selector) in selectors(player) {
            if let Some(first) = claimed.insert(selector, &player.name) {
                return Err(PlanError::DeviceConflict {
                    device: selector.to_string(),
                    first: first.to_string(),
                    second: player.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Resolves every selector against the inventory by exact identifier match.
/// Two distinct selectors resolving to the same node is a conflict too.
fn resolve_devices(
    players: &[Player],
    inventory: &DeviceInventory,
) -> Result<Vec<Vec<DeviceNode>>, PlanError> {
    let mut resolved_nodes: BTreeMap<PathBuf, String> = BTreeMap::new();
    let mut assignments = Vec::with_capacity(players.len());

    for player in players {
        let mut devices = Vec::new();
        for (class, selector) in selectors(player) {
            let node = inventory
                .lookup(selector)
                .ok_or_else(|| PlanError::DeviceNotFound {
                    class,
                    selector: selector.to_string(),
                    player: player.name.clone(),
                })?;
            if node.class != class {
                log::warn!(
                    "Selector '{}' for player '{}' names a {} but was given as the {} binding",
                    selector,
                    player.name,
                    node.class,
                    class
                );
            }
            if let Some(first) = resolved_nodes.insert(node.path.clone(), player.name.clone()) {
                return Err(PlanError::DeviceConflict {
                    device: node.path.display().to_string(),
                    first,
                    second: player.name.clone(),
                });
            }
            devices.push(node.clone());
        }
        assignments.push(devices);
    }

    Ok(assignments)
}

/// Computes one geometry slot per instance.
///
/// Tiling partitions the configured total area into equal slots; the last
/// slot absorbs the division remainder so the slots tile the area exactly.
fn compute_geometry(mode: &LaunchMode, count: usize) -> Result<Vec<Geometry>, PlanError> {
    match mode {
        LaunchMode::Windows { geometries } => {
            if geometries.len() != count {
                return Err(PlanError::GeometryMismatch {
                    expected: count,
                    actual: geometries.len(),
                });
            }
            Ok(geometries.clone())
        }
        LaunchMode::Splitscreen {
            orientation,
            width,
            height,
        } => {
            let k = count as u32;
            let mut slots = Vec::with_capacity(count);
            match orientation {
                // Horizontal split: full-width rows stacked top to bottom.
                Orientation::Horizontal => {
                    let slot_height = height / k;
                    for i in 0..count as u32 {
                        let h = if i == k - 1 {
                            height - slot_height * (k - 1)
                        } else {
                            slot_height
                        };
                        slots.push(Geometry {
                            x: 0,
                            y: (i * slot_height) as i32,
                            width: *width,
                            height: h,
                        });
                    }
                }
                // Vertical split: full-height columns, left to right.
                Orientation::Vertical => {
                    let slot_width = width / k;
                    for i in 0..count as u32 {
                        let w = if i == k - 1 {
                            width - slot_width * (k - 1)
                        } else {
                            slot_width
                        };
                        slots.push(Geometry {
                            x: (i * slot_width) as i32,
                            y: 0,
                            width: w,
                            height: *height,
                        });
                    }
                }
            }
            Ok(slots)
        }
    }
}

/// Derives the namespaced per-instance prefix directories and rejects any
/// prefix that is already locked by a live run. Shared prefixes corrupt
/// independent save state, so collision is fatal rather than reused.
fn derive_prefixes(profile: &Profile, data_root: &Path) -> Result<Vec<PathBuf>, PlanError> {
    let base = data_root.join("prefixes").join(&profile.game_name);
    let mut seen: Vec<PathBuf> = Vec::new();
    let mut prefixes = Vec::with_capacity(profile.players.len());

    for ordinal in 0..profile.players.len() {
        let prefix = base.join(format!("instance_{}", ordinal + 1));
        if seen.contains(&prefix) {
            return Err(PlanError::PrefixCollision { prefix });
        }
        // Read-only check; the lock itself is written by the assembler.
        if prefix.join(PREFIX_LOCK_NAME).exists() {
            return Err(PlanError::PrefixCollision { prefix });
        }
        seen.push(prefix.clone());
        prefixes.push(prefix);
    }

    Ok(prefixes)
}

fn merge_env(profile: &Profile, player: &Player) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if !profile.is_native {
        env.insert("PROTON_NO_ESYNC".to_string(), "0".to_string());
        env.insert("PROTON_NO_FSYNC".to_string(), "0".to_string());
    }
    for (key, value) in &profile.env {
        env.insert(key.clone(), value.clone());
    }
    for (key, value) in &player.env {
        env.insert(key.clone(), value.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::node;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn player(name: &str) -> Player {
        Player {
            name: name.to_string(),
            locale: "english".to_string(),
            listen_port: 0,
            account_id: None,
            controller: None,
            mouse: None,
            keyboard: None,
            env: BTreeMap::new(),
        }
    }

    fn two_player_profile() -> Profile {
        Profile {
            game_name: "testgame".to_string(),
            exe_path: PathBuf::from("/games/testgame/game.exe"),
            proton_version: None,
            is_native: false,
            mode: LaunchMode::Splitscreen {
                orientation: Orientation::Horizontal,
                width: 1920,
                height: 1080,
            },
            env: BTreeMap::new(),
            goldberg_identity: false,
            use_gamescope: true,
            disable_bwrap: false,
            game_args: Vec::new(),
            players: vec![player("alice"), player("bob")],
        }
    }

    fn pads_inventory() -> DeviceInventory {
        DeviceInventory::from_nodes(vec![
            node("/dev/input/event3", "Pad C1", DeviceClass::Controller),
            node("/dev/input/event4", "Pad C2", DeviceClass::Controller),
            node("/dev/input/event5", "Mouse", DeviceClass::Mouse),
            node("/dev/input/event6", "Keyboard", DeviceClass::Keyboard),
        ])
    }

    #[test]
    fn test_duplicate_selector_is_a_conflict() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.players[0].controller = Some("/dev/input/event3".to_string());
        profile.players[1].controller = Some("/dev/input/event3".to_string());

        let err = build(&profile, &pads_inventory(), dir.path())
            .expect_err("duplicate selector must fail");
        match err {
            PlanError::DeviceConflict { device, first, second } => {
                assert_eq!(device, "/dev/input/event3");
                assert_eq!(first, "alice");
                assert_eq!(second, "bob");
            }
            other => panic!("expected DeviceConflict, got: {other}"),
        }
    }

    #[test]
    fn test_aliased_selectors_resolving_to_one_node_conflict() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        // Same physical pad, addressed by path and by name.
        profile.players[0].controller = Some("/dev/input/event3".to_string());
        profile.players[1].controller = Some("Pad C1".to_string());

        let err = build(&profile, &pads_inventory(), dir.path())
            .expect_err("aliased selectors must fail");
        assert!(matches!(err, PlanError::DeviceConflict { .. }));
    }

    #[test]
    fn test_unknown_selector_is_not_found() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.players[0].controller = Some("/dev/input/event99".to_string());

        let err = build(&profile, &pads_inventory(), dir.path())
            .expect_err("unknown selector must fail");
        match err {
            PlanError::DeviceNotFound { selector, player, .. } => {
                assert_eq!(selector, "/dev/input/event99");
                assert_eq!(player, "alice");
            }
            other => panic!("expected DeviceNotFound, got: {other}"),
        }
    }

    #[test]
    fn test_device_sets_are_pairwise_disjoint() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.players[0].controller = Some("/dev/input/event3".to_string());
        profile.players[0].mouse = Some("/dev/input/event5".to_string());
        profile.players[1].controller = Some("/dev/input/event4".to_string());
        profile.players[1].keyboard = Some("/dev/input/event6".to_string());

        let plans = build(&profile, &pads_inventory(), dir.path()).expect("build failed");

        let mut all_paths = BTreeSet::new();
        let total: usize = plans.iter().map(|p| p.devices.len()).sum();
        for plan in &plans {
            for device in &plan.devices {
                all_paths.insert(device.path.clone());
            }
        }
        assert_eq!(all_paths.len(), total, "device sets overlap");
    }

    // Scenario A: two controllers bound, horizontal splitscreen.
    #[test]
    fn test_two_controllers_horizontal_splitscreen() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.players[0].controller = Some("/dev/input/event3".to_string());
        profile.players[1].controller = Some("/dev/input/event4".to_string());

        let plans = build(&profile, &pads_inventory(), dir.path()).expect("build failed");
        assert_eq!(plans.len(), 2);

        assert_eq!(plans[0].devices.len(), 1);
        assert_eq!(plans[0].devices[0].name, "Pad C1");
        assert_eq!(plans[1].devices.len(), 1);
        assert_eq!(plans[1].devices[0].name, "Pad C2");

        // Top and bottom slots.
        assert_eq!(plans[0].geometry, Geometry { x: 0, y: 0, width: 1920, height: 540 });
        assert_eq!(plans[1].geometry, Geometry { x: 0, y: 540, width: 1920, height: 540 });

        assert_ne!(plans[0].prefix_dir, plans[1].prefix_dir);
    }

    // Scenario B: no selectors at all means zero devices, not a shared default.
    #[test]
    fn test_default_deny_when_no_selectors() {
        let dir = tempdir().expect("failed to create temp dir");
        let profile = two_player_profile();

        let plans = build(&profile, &pads_inventory(), dir.path()).expect("build failed");
        for plan in &plans {
            assert!(plan.devices.is_empty());
            assert!(!plan.grants(DeviceClass::Controller));
        }
    }

    // Scenario C: a live lock from a concurrent run blocks plan building.
    #[test]
    fn test_prefix_collision_with_live_lock() {
        let dir = tempdir().expect("failed to create temp dir");
        let profile = two_player_profile();

        let locked = dir
            .path()
            .join("prefixes")
            .join("testgame")
            .join("instance_2");
        std::fs::create_dir_all(&locked).expect("failed to create prefix dir");
        std::fs::write(locked.join(PREFIX_LOCK_NAME), b"12345").expect("failed to write lock");

        let err = build(&profile, &pads_inventory(), dir.path())
            .expect_err("locked prefix must fail");
        match err {
            PlanError::PrefixCollision { prefix } => assert_eq!(prefix, locked),
            other => panic!("expected PrefixCollision, got: {other}"),
        }
    }

    #[test]
    fn test_tiling_exact_with_odd_totals() {
        for (orientation, count) in [(Orientation::Horizontal, 3), (Orientation::Vertical, 3)] {
            let mode = LaunchMode::Splitscreen {
                orientation,
                width: 1921,
                height: 1081,
            };
            let slots = compute_geometry(&mode, count).expect("tiling failed");
            assert_eq!(slots.len(), count);

            let area: u64 = slots
                .iter()
                .map(|g| g.width as u64 * g.height as u64)
                .sum();
            assert_eq!(area, 1921 * 1081, "slots must cover the area exactly");

            // Adjacent slots must abut with no gap or overlap.
            for pair in slots.windows(2) {
                match orientation {
                    Orientation::Horizontal => {
                        assert_eq!(pair[0].y + pair[0].height as i32, pair[1].y);
                        assert_eq!(pair[0].width, 1921);
                    }
                    Orientation::Vertical => {
                        assert_eq!(pair[0].x + pair[0].width as i32, pair[1].x);
                        assert_eq!(pair[0].height, 1081);
                    }
                }
            }
        }
    }

    #[test]
    fn test_windows_mode_geometry_count_must_match() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.mode = LaunchMode::Windows {
            geometries: vec![Geometry { x: 0, y: 0, width: 800, height: 600 }],
        };

        let err = build(&profile, &pads_inventory(), dir.path())
            .expect_err("geometry count mismatch must fail");
        assert!(matches!(
            err,
            PlanError::GeometryMismatch { expected: 2, actual: 1 }
        ));
    }

    #[test]
    fn test_env_merge_precedence() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.env.insert("SHARED".to_string(), "profile".to_string());
        profile.env.insert("GLOBAL".to_string(), "yes".to_string());
        profile.players[0]
            .env
            .insert("SHARED".to_string(), "player".to_string());
        profile
            .env
            .insert("PROTON_NO_ESYNC".to_string(), "1".to_string());

        let plans = build(&profile, &pads_inventory(), dir.path()).expect("build failed");

        // Player layer wins over the profile layer.
        assert_eq!(plans[0].env.get("SHARED").map(String::as_str), Some("player"));
        assert_eq!(plans[1].env.get("SHARED").map(String::as_str), Some("profile"));
        assert_eq!(plans[1].env.get("GLOBAL").map(String::as_str), Some("yes"));
        // Profile layer wins over the built-in default.
        assert_eq!(
            plans[0].env.get("PROTON_NO_ESYNC").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn test_identity_and_port_defaults_are_deterministic() {
        let dir = tempdir().expect("failed to create temp dir");
        let mut profile = two_player_profile();
        profile.players[1].account_id = Some("custom".to_string());
        profile.players[1].listen_port = 50000;

        let first = build(&profile, &pads_inventory(), dir.path()).expect("build failed");
        let second = build(&profile, &pads_inventory(), dir.path()).expect("build failed");
        assert_eq!(first, second, "plans must be reproducible");

        assert_eq!(first[0].account_id, "testgame-p1");
        assert_eq!(first[0].listen_port, BASE_LISTEN_PORT);
        assert_eq!(first[1].account_id, "custom");
        assert_eq!(first[1].listen_port, 50000);
    }
}
