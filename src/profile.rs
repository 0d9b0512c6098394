//! Game profile data model
//!
//! A profile describes one co-op session: the game executable, the players
//! taking part, the launch mode and the environment overrides. Profiles are
//! loaded once from a TOML file at startup and are read-only afterwards;
//! everything derived from them (device assignments, prefixes, geometry)
//! lives in the per-run instance plans.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to read profile '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse profile: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid profile: {0}")]
    Invalid(String),
}

/// Window placement for one instance, in screen coordinates.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Instances stacked as full-width rows, top to bottom.
    Horizontal,
    /// Instances placed as full-height columns, left to right.
    Vertical,
}

/// How the instances are presented on screen.
///
/// `Splitscreen` carries the total area to partition into equal slots;
/// `Windows` carries one verbatim geometry per instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchMode {
    Splitscreen {
        orientation: Orientation,
        width: u32,
        height: u32,
    },
    Windows {
        geometries: Vec<Geometry>,
    },
}

impl LaunchMode {
    pub fn is_splitscreen(&self) -> bool {
        matches!(self, LaunchMode::Splitscreen { .. })
    }
}

/// One human participant. The three device selectors are optional; an empty
/// or missing selector means "no explicit binding for this class" and the
/// instance will see no device of that class at all.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub name: String,

    #[serde(default = "default_locale")]
    pub locale: String,

    /// Local listen port for the instance; 0 means "assign from the base
    /// port by ordinal".
    #[serde(default)]
    pub listen_port: u16,

    /// Synthetic account identity. When absent a deterministic one is
    /// synthesized from the game name and the instance ordinal.
    #[serde(default)]
    pub account_id: Option<String>,

    /// Controller selector: event node path or exact device name.
    #[serde(default)]
    pub controller: Option<String>,

    /// Mouse event node path or exact device name.
    #[serde(default)]
    pub mouse: Option<String>,

    /// Keyboard event node path or exact device name.
    #[serde(default)]
    pub keyboard: Option<String>,

    /// Player-specific environment overrides (highest precedence layer).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_locale() -> String {
    "english".to_string()
}

fn default_true() -> bool {
    true
}

/// A validated co-op session description.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    /// Prefix-deriving name; sanitized on load.
    pub game_name: String,

    /// Game executable. `~` is expanded on load.
    pub exe_path: PathBuf,

    /// Compatibility-layer version identifier, e.g. "Experimental" or "9.0".
    #[serde(default)]
    pub proton_version: Option<String>,

    /// True for native Linux binaries; derived from the executable suffix
    /// when not set explicitly. Native instances skip the compat layer.
    #[serde(default)]
    pub is_native: bool,

    pub mode: LaunchMode,

    /// Global environment overrides, applied below player-specific ones.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Select the Goldberg-style identity-emulation backend instead of the
    /// generic per-instance identity variables.
    #[serde(default)]
    pub goldberg_identity: bool,

    /// Wrap each instance in a gamescope micro-compositor window.
    #[serde(default = "default_true")]
    pub use_gamescope: bool,

    /// Escape hatch: skip the bwrap device sandbox entirely. Input device
    /// isolation does not work without it.
    #[serde(default)]
    pub disable_bwrap: bool,

    /// Extra arguments appended after the executable.
    #[serde(default)]
    pub game_args: Vec<String>,

    pub players: Vec<Player>,
}

impl Profile {
    /// Loads and validates a profile from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        log::info!("Loading profile from {}", path.display());
        let raw = fs::read_to_string(path).map_err(|source| ProfileError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut profile: Profile = toml::from_str(&raw)?;
        profile.normalize();
        profile.validate()?;
        Ok(profile)
    }

    /// Expands user-supplied paths, derives `is_native` from the executable
    /// suffix and sanitizes the prefix-deriving name.
    fn normalize(&mut self) {
        let expanded = shellexpand::tilde(&self.exe_path.to_string_lossy().into_owned()).into_owned();
        self.exe_path = PathBuf::from(expanded);

        if !self.is_native {
            let is_windows_exe = self
                .exe_path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("exe"))
                .unwrap_or(false);
            if !is_windows_exe {
                log::info!(
                    "Executable '{}' has no .exe suffix, treating it as a native binary",
                    self.exe_path.display()
                );
                self.is_native = true;
            }
        }

        self.game_name = sanitize_name(&self.game_name);
    }

    fn validate(&self) -> Result<(), ProfileError> {
        if self.game_name.is_empty() {
            return Err(ProfileError::Invalid(
                "game_name is empty after sanitization".to_string(),
            ));
        }
        if self.players.is_empty() {
            return Err(ProfileError::Invalid(
                "profile declares no players".to_string(),
            ));
        }
        if let LaunchMode::Splitscreen { width, height, .. } = self.mode {
            if width == 0 || height == 0 {
                return Err(ProfileError::Invalid(format!(
                    "splitscreen area {}x{} is degenerate",
                    width, height
                )));
            }
        }
        for player in &self.players {
            if player.name.trim().is_empty() {
                return Err(ProfileError::Invalid(
                    "player with an empty name".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Keeps alphanumerics, `-` and `_`; everything else becomes `_`.
/// Prefix directories are derived from this name, so it must be path-safe.
fn sanitize_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
