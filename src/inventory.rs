//! Device inventory resolver
//!
//! Enumerates the host's input device nodes and classifies them by
//! capability so the plan builder can resolve the per-player selectors
//! against a stable, point-in-time snapshot. The snapshot is rebuilt fresh
//! for every run and is never persisted; nothing here mutates host state.

use evdev::{Device, Key, RelativeAxisType};
use std::env;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment override for the device namespace, mirroring the default of
/// `/dev/input`. Mostly useful for tests and containers.
pub const INPUT_DIR_ENV: &str = "COOPSPAWN_INPUT_DIR";

const DEFAULT_INPUT_DIR: &str = "/dev/input";

#[derive(Error, Debug)]
pub enum InventoryError {
    #[error("input device namespace '{}' is unreadable: {source}", .path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Capability class of a physical input device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceClass {
    Keyboard,
    Mouse,
    Controller,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Keyboard => write!(f, "keyboard"),
            DeviceClass::Mouse => write!(f, "mouse"),
            DeviceClass::Controller => write!(f, "controller"),
        }
    }
}

/// One enumerated input device node. The node path is the stable identifier
/// selectors are matched against; the name is accepted as a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub name: String,
    pub vendor: u16,
    pub product: u16,
    pub class: DeviceClass,
}

/// Immutable point-in-time snapshot of the host's input devices.
///
/// Shared read-only by all plan computations within a run; device
/// assignment is a pure function of (profile, snapshot).
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    nodes: Vec<DeviceNode>,
}

impl DeviceInventory {
    pub fn from_nodes(mut nodes: Vec<DeviceNode>) -> Self {
        // Stable ordering keeps plan construction deterministic.
        nodes.sort_by(|a, b| a.path.cmp(&b.path));
        DeviceInventory { nodes }
    }

    pub fn nodes(&self) -> &[DeviceNode] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves a selector by exact node path, falling back to an exact
    /// device-name match.
    pub fn lookup(&self, selector: &str) -> Option<&DeviceNode> {
        self.nodes
            .iter()
            .find(|node| node.path == Path::new(selector))
            .or_else(|| self.nodes.iter().find(|node| node.name == selector))
    }

    pub fn controllers(&self) -> impl Iterator<Item = &DeviceNode> {
        self.nodes
            .iter()
            .filter(|node| node.class == DeviceClass::Controller)
    }
}

/// Enumerates and classifies the host's input device nodes.
///
/// Nodes that cannot be opened (usually a permissions problem on a single
/// `event*` file) are skipped with a warning; an unreadable namespace
/// directory is fatal.
pub fn resolve() -> Result<DeviceInventory, InventoryError> {
    let input_dir =
        PathBuf::from(env::var(INPUT_DIR_ENV).unwrap_or_else(|_| DEFAULT_INPUT_DIR.to_string()));
    resolve_in(&input_dir)
}

fn resolve_in(input_dir: &Path) -> Result<DeviceInventory, InventoryError> {
    log::info!("Enumerating input devices in {}", input_dir.display());

    let entries = fs::read_dir(input_dir).map_err(|source| InventoryError::Unreadable {
        path: input_dir.to_path_buf(),
        source,
    })?;

    let mut nodes = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("Skipping unreadable directory entry: {}", e);
                continue;
            }
        };
        let path = entry.path();
        let is_event_node = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with("event"))
            .unwrap_or(false);
        if !is_event_node {
            log::debug!("Skipping non-event node {}", path.display());
            continue;
        }

        match Device::open(&path) {
            Ok(device) => {
                if let Some(node) = classify(&path, &device) {
                    log::info!(
                        "Found {} '{}' at {}",
                        node.class,
                        node.name,
                        node.path.display()
                    );
                    nodes.push(node);
                } else {
                    log::debug!("Skipping unclassified device at {}", path.display());
                }
            }
            Err(e) => {
                log::warn!("Failed to open device {}: {}", path.display(), e);
            }
        }
    }

    if nodes.is_empty() {
        log::warn!(
            "No usable input devices found in {}. Check read permissions on event* nodes.",
            input_dir.display()
        );
    } else {
        log::info!("Enumerated {} usable input devices", nodes.len());
    }

    Ok(DeviceInventory::from_nodes(nodes))
}

fn classify(path: &Path, device: &Device) -> Option<DeviceNode> {
    let input_id = device.input_id();
    let vendor = input_id.vendor();
    let product = input_id.product();
    let name = device.name().unwrap_or("Unknown").to_string();

    let keys = device.supported_keys();
    let has_key = |key: Key| keys.map(|set| set.contains(key)).unwrap_or(false);
    let has_rel_x = device
        .supported_relative_axes()
        .map(|set| set.contains(RelativeAxisType::REL_X))
        .unwrap_or(false);

    let class = if has_key(Key::BTN_SOUTH) || has_key(Key::BTN_TRIGGER) || is_gamepad_vendor(vendor)
    {
        DeviceClass::Controller
    } else if has_key(Key::BTN_LEFT) && has_rel_x {
        DeviceClass::Mouse
    } else if has_key(Key::KEY_A) && has_key(Key::KEY_SPACE) {
        DeviceClass::Keyboard
    } else {
        return None;
    };

    Some(DeviceNode {
        path: path.to_path_buf(),
        name,
        vendor,
        product,
        class,
    })
}

/// Vendor ids of common gamepad manufacturers; used as a classification
/// fallback for pads that expose unusual button sets.
fn is_gamepad_vendor(vendor: u16) -> bool {
    matches!(
        vendor,
        0x045e // Microsoft
        | 0x054c // Sony
        | 0x28de // Valve
        | 0x0e6f // PDP/Logic3
        | 0x0f0d // Hori
        | 0x2dc8 // 8BitDo
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn node(path: &str, name: &str, class: DeviceClass) -> DeviceNode {
        DeviceNode {
            path: PathBuf::from(path),
            name: name.to_string(),
            vendor: 0x054c,
            product: 0x0ce6,
            class,
        }
    }

    #[test]
    fn test_lookup_prefers_path_over_name() {
        let inventory = DeviceInventory::from_nodes(vec![
            node("/dev/input/event3", "Pad A", DeviceClass::Controller),
            node("/dev/input/event5", "/dev/input/event3", DeviceClass::Controller),
        ]);

        let found = inventory.lookup("/dev/input/event3").expect("no match");
        assert_eq!(found.name, "Pad A");
    }

    #[test]
    fn test_lookup_falls_back_to_name() {
        let inventory = DeviceInventory::from_nodes(vec![node(
            "/dev/input/event7",
            "Sony DualSense",
            DeviceClass::Controller,
        )]);

        let found = inventory.lookup("Sony DualSense").expect("no match");
        assert_eq!(found.path, PathBuf::from("/dev/input/event7"));
    }

    #[test]
    fn test_controllers_filter() {
        let inventory = DeviceInventory::from_nodes(vec![
            node("/dev/input/event1", "kbd", DeviceClass::Keyboard),
            node("/dev/input/event2", "pad", DeviceClass::Controller),
            node("/dev/input/event4", "mouse", DeviceClass::Mouse),
        ]);

        let controllers: Vec<_> = inventory.controllers().collect();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].name, "pad");
    }

    #[test]
    fn test_resolve_empty_directory() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let inventory = resolve_in(dir.path()).expect("empty directory should resolve");
        assert!(inventory.is_empty());
    }

    #[test]
    fn test_resolve_missing_directory_is_unreadable() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let missing = dir.path().join("no-such-dir");
        let err = resolve_in(&missing).expect_err("missing directory must fail");
        assert!(matches!(err, InventoryError::Unreadable { .. }));
    }

    // Enumerating real hardware needs read access to /dev/input/event*.
    #[test]
    #[ignore]
    fn test_resolve_host_devices() {
        let inventory = resolve().expect("enumeration failed");
        for node in inventory.nodes() {
            eprintln!("{} {} ({})", node.path.display(), node.name, node.class);
        }
    }
}
