//! Compatibility-layer invocation helper
//!
//! Locates the Proton runtime, checks whether a target looks like a Windows
//! PE binary, and produces the environment a prefixed instance needs. The
//! runtime itself is treated as an opaque executable; this module only
//! constructs paths, arguments and environment for it.

use std::env;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompatError {
    #[error("compatibility layer I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("runtime not found: {0}")]
    RuntimeNotFound(String),
}

/// A located Proton installation together with the Steam root it belongs
/// to. The Steam root is exported to instances as the compat client path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    pub proton: PathBuf,
    pub steam_root: PathBuf,
}

/// Checks for the "MZ" PE header. Not foolproof, but enough to warn when a
/// profile marked non-native points at something Proton cannot run.
pub fn is_windows_binary(file_path: &Path) -> Result<bool, CompatError> {
    let mut file = match File::open(file_path) {
        Ok(file) => file,
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CompatError::Io(e)),
    };

    let mut buffer = [0u8; 2];
    if file.read_exact(&mut buffer).is_err() {
        return Ok(false);
    }
    Ok(buffer == [0x4D, 0x5A])
}

/// Attempts to locate a Proton runtime.
///
/// Strategies, in order: the `PROTON_PATH` environment variable, then a
/// scan of the Steam root's `compatibilitytools.d` and
/// `steamapps/common` directories. When `version` is given, only
/// installations whose directory name contains it (case-insensitive) are
/// accepted from the scan.
pub fn find_runtime(version: Option<&str>) -> Result<Runtime, CompatError> {
    log::info!(
        "Locating Proton runtime{}",
        version.map(|v| format!(" '{v}'")).unwrap_or_default()
    );

    let steam_root = find_steam_root();

    if let Ok(explicit) = env::var("PROTON_PATH") {
        let proton = PathBuf::from(explicit);
        if proton.is_file() {
            log::info!("Using Proton from PROTON_PATH: {}", proton.display());
            let steam_root = steam_root.unwrap_or_else(|| {
                proton
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/"))
            });
            return Ok(Runtime { proton, steam_root });
        }
        log::warn!("PROTON_PATH is set but does not point at a file: {}", proton.display());
    }

    let steam_root = steam_root.ok_or_else(|| {
        CompatError::RuntimeNotFound(
            "no Steam root found; set PROTON_PATH or STEAM_ROOT".to_string(),
        )
    })?;

    let search_dirs = [
        steam_root.join("compatibilitytools.d"),
        steam_root.join("steamapps").join("common"),
    ];

    let mut candidates: Vec<PathBuf> = Vec::new();
    for dir in &search_dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let proton = entry.path().join("proton");
            if !proton.is_file() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_lowercase();
            if let Some(version) = version {
                if !dir_name.contains(&version.to_lowercase()) {
                    continue;
                }
            } else if !dir_name.contains("proton") {
                continue;
            }
            candidates.push(proton);
        }
    }
    candidates.sort();

    match candidates.pop() {
        Some(proton) => {
            log::info!("Found Proton runtime at {}", proton.display());
            Ok(Runtime { proton, steam_root })
        }
        None => Err(CompatError::RuntimeNotFound(format!(
            "no Proton installation{} under {}",
            version.map(|v| format!(" matching '{v}'")).unwrap_or_default(),
            steam_root.display()
        ))),
    }
}

fn find_steam_root() -> Option<PathBuf> {
    if let Ok(explicit) = env::var("STEAM_ROOT") {
        let root = PathBuf::from(explicit);
        if root.is_dir() {
            return Some(root);
        }
        log::warn!("STEAM_ROOT is set but is not a directory: {}", root.display());
    }

    let home = dirs::home_dir()?;
    [
        home.join(".steam").join("steam"),
        home.join(".local").join("share").join("Steam"),
    ]
    .into_iter()
    .find(|root| root.is_dir())
}

/// Environment a prefixed instance needs: the compat data path, the Steam
/// client path and the wine prefix inside the instance's state root.
pub fn runtime_env(runtime: &Runtime, prefix_dir: &Path) -> Vec<(String, String)> {
    vec![
        (
            "STEAM_COMPAT_DATA_PATH".to_string(),
            prefix_dir.display().to_string(),
        ),
        (
            "STEAM_COMPAT_CLIENT_INSTALL_PATH".to_string(),
            runtime.steam_root.display().to_string(),
        ),
        (
            "WINEPREFIX".to_string(),
            prefix_dir.join("pfx").display().to_string(),
        ),
        ("PROTON_LOG".to_string(), "1".to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_is_windows_binary_mz_header() {
        let dir = tempdir().expect("failed to create temp dir");
        let file = dir.path().join("game.exe");
        fs::write(&file, b"MZ rest of the header").expect("failed to write file");
        assert!(is_windows_binary(&file).expect("check failed"));
    }

    #[test]
    fn test_is_windows_binary_other_header() {
        let dir = tempdir().expect("failed to create temp dir");
        let file = dir.path().join("game.bin");
        fs::write(&file, b"\x7fELF").expect("failed to write file");
        assert!(!is_windows_binary(&file).expect("check failed"));
    }

    #[test]
    fn test_is_windows_binary_empty_and_missing() {
        let dir = tempdir().expect("failed to create temp dir");
        let empty = dir.path().join("empty");
        fs::write(&empty, b"").expect("failed to write file");
        assert!(!is_windows_binary(&empty).expect("check failed"));
        assert!(!is_windows_binary(&dir.path().join("missing")).expect("check failed"));
    }

    #[test]
    fn test_runtime_env_points_into_prefix() {
        let runtime = Runtime {
            proton: PathBuf::from("/steam/compatibilitytools.d/GE-Proton9/proton"),
            steam_root: PathBuf::from("/steam"),
        };
        let env = runtime_env(&runtime, Path::new("/data/prefixes/game/instance_1"));
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
                .unwrap_or_default()
        };
        assert_eq!(get("STEAM_COMPAT_DATA_PATH"), "/data/prefixes/game/instance_1");
        assert_eq!(get("STEAM_COMPAT_CLIENT_INSTALL_PATH"), "/steam");
        assert_eq!(get("WINEPREFIX"), "/data/prefixes/game/instance_1/pfx");
        assert_eq!(get("PROTON_LOG"), "1");
    }

    #[test]
    fn test_find_runtime_scans_compatibilitytools() {
        let dir = tempdir().expect("failed to create temp dir");
        let tool = dir.path().join("compatibilitytools.d").join("GE-Proton9-5");
        fs::create_dir_all(&tool).expect("failed to create tool dir");
        fs::write(tool.join("proton"), b"#!/bin/sh\n").expect("failed to write stub");

        env::set_var("STEAM_ROOT", dir.path());
        env::remove_var("PROTON_PATH");
        let runtime = find_runtime(Some("ge-proton9")).expect("runtime not found");
        env::remove_var("STEAM_ROOT");

        assert_eq!(runtime.proton, tool.join("proton"));
        assert_eq!(runtime.steam_root, dir.path());
    }
}
