//! Sandbox environment assembler
//!
//! Turns an instance plan into a concrete launch specification: the
//! per-instance mirror of the game directory, the bwrap invocation that
//! restricts the instance's device view to exactly the granted nodes, the
//! gamescope wrapper that pins its rendering surface, the compat-layer
//! runner and the fully merged environment.
//!
//! Assembly is idempotent: re-assembling the same plan overwrites its
//! transient artifacts instead of accumulating them, and the resource
//! registry deduplicates by path.

use crate::cleanup::{ResourceRegistry, TransientResource};
use crate::compat::{self, CompatError, Runtime};
use crate::inventory::{DeviceClass, DeviceInventory};
use crate::plan::{InstancePlan, PREFIX_LOCK_NAME};
use crate::profile::Profile;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("sandbox I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("required tool '{0}' not found on PATH")]
    MissingTool(String),

    #[error("game executable '{}' is not a readable file", .0.display())]
    ExecutableUnreadable(PathBuf),

    #[error("game directory mirror incomplete: '{}' was not created", .0.display())]
    MirrorIncomplete(PathBuf),

    #[error("compatibility runtime unavailable: {0}")]
    Runtime(#[from] CompatError),
}

/// A fully resolved, spawnable description of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub ordinal: usize,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub log_file: PathBuf,
}

/// Builds launch specifications for one run. Constructed once per run so
/// tool preflight and runtime discovery happen a single time.
pub struct Assembler<'a> {
    profile: &'a Profile,
    inventory: &'a DeviceInventory,
    run_dir: PathBuf,
    runtime: Option<Runtime>,
}

impl<'a> Assembler<'a> {
    /// Preflights external tools and, for non-native games, locates the
    /// compat runtime. Fails before any instance side effects happen.
    pub fn new(
        profile: &'a Profile,
        inventory: &'a DeviceInventory,
        run_dir: PathBuf,
    ) -> Result<Self, SandboxError> {
        if profile.disable_bwrap {
            log::warn!("bwrap is disabled: input device isolation will NOT work");
        } else if !tool_on_path("bwrap") {
            return Err(SandboxError::MissingTool("bwrap".to_string()));
        }

        if profile.use_gamescope && !tool_on_path("gamescope") {
            return Err(SandboxError::MissingTool("gamescope".to_string()));
        }

        let runtime = if profile.is_native {
            None
        } else {
            Some(compat::find_runtime(profile.proton_version.as_deref())?)
        };

        fs::create_dir_all(&run_dir)?;

        Ok(Assembler {
            profile,
            inventory,
            run_dir,
            runtime,
        })
    }

    /// Materializes one plan: prefix directories, game mirror, lock file,
    /// controller blacklist, environment and the full argument vector.
    pub fn assemble(
        &self,
        plan: &InstancePlan,
        registry: &mut ResourceRegistry,
    ) -> Result<LaunchSpec, SandboxError> {
        log::info!(
            "Assembling sandbox for instance {} ('{}')",
            plan.ordinal,
            plan.player_name
        );

        if !plan.exe_path.is_file() {
            return Err(SandboxError::ExecutableUnreadable(plan.exe_path.clone()));
        }
        if !self.profile.is_native {
            match compat::is_windows_binary(&plan.exe_path) {
                Ok(true) => {}
                Ok(false) => log::warn!(
                    "'{}' does not look like a Windows binary; the compat layer may reject it",
                    plan.exe_path.display()
                ),
                Err(e) => log::warn!("Windows binary check failed: {}", e),
            }
        }

        fs::create_dir_all(plan.prefix_dir.join("pfx"))?;

        // Each instance runs from its own mirrored copy of the install, so
        // games that write settings or saves beside the executable write
        // into the instance's tree instead of the shared directory.
        let instance_exe = self.mirror_game_dir(plan)?;

        let lock_path = plan.prefix_dir.join(PREFIX_LOCK_NAME);
        fs::write(&lock_path, std::process::id().to_string())?;
        registry.register(TransientResource::PrefixLock(lock_path));

        let ignore_list = self.write_blacklist(plan, registry)?;
        let env = self.build_env(plan, &ignore_list);
        let argv = self.build_argv(plan, &instance_exe);

        let cwd = instance_exe
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut argv = argv.into_iter();
        let program = argv.next().unwrap_or_else(|| {
            // Unreachable: build_argv always ends with the executable.
            instance_exe.display().to_string()
        });

        Ok(LaunchSpec {
            ordinal: plan.ordinal,
            program,
            args: argv.collect(),
            env,
            cwd,
            log_file: self
                .run_dir
                .join(format!("instance_{}.log", plan.ordinal + 1)),
        })
    }

    /// Mirrors the game directory into `<prefix>/game_files` as a symlink
    /// tree and returns the instance's own path to the executable. Existing
    /// links are kept, so re-assembly and later runs reuse the mirror. The
    /// mirror persists with the prefix and is never registered for cleanup.
    fn mirror_game_dir(&self, plan: &InstancePlan) -> Result<PathBuf, SandboxError> {
        let game_root = plan
            .exe_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let mirror_root = plan.prefix_dir.join("game_files");

        log::info!(
            "Instance {}: mirroring {} into {}",
            plan.ordinal,
            game_root.display(),
            mirror_root.display()
        );
        fs::create_dir_all(&mirror_root)?;
        link_tree(&game_root, &mirror_root, &mirror_root)?;

        let exe_name = plan
            .exe_path
            .file_name()
            .ok_or_else(|| SandboxError::ExecutableUnreadable(plan.exe_path.clone()))?;
        let instance_exe = mirror_root.join(exe_name);
        if fs::symlink_metadata(&instance_exe).is_err() {
            return Err(SandboxError::MirrorIncomplete(instance_exe));
        }
        Ok(instance_exe)
    }

    /// Writes the per-instance controller blacklist: every controller in
    /// the inventory snapshot that was NOT granted to this instance.
    /// Overwritten on re-assembly, never appended.
    fn write_blacklist(
        &self,
        plan: &InstancePlan,
        registry: &mut ResourceRegistry,
    ) -> Result<String, SandboxError> {
        let granted: Vec<&Path> = plan
            .devices
            .iter()
            .filter(|node| node.class == DeviceClass::Controller)
            .map(|node| node.path.as_path())
            .collect();

        // BTreeSet collapses identical pads wherever they sit in path order.
        let entries: BTreeSet<String> = self
            .inventory
            .controllers()
            .filter(|node| !granted.contains(&node.path.as_path()))
            .map(|node| format!("0x{:04x}/0x{:04x}", node.vendor, node.product))
            .collect();
        let entries: Vec<String> = entries.into_iter().collect();

        let path = self.run_dir.join(format!("blacklist_{}.txt", plan.ordinal));
        fs::write(&path, entries.join("\n"))?;
        registry.register(TransientResource::BlacklistFile(path));

        Ok(entries.join(","))
    }

    fn build_env(&self, plan: &InstancePlan, ignore_list: &str) -> BTreeMap<String, String> {
        let mut env = plan.env.clone();

        if let Some(runtime) = &self.runtime {
            for (key, value) in compat::runtime_env(runtime, &plan.prefix_dir) {
                env.entry(key).or_insert(value);
            }
        }

        // Device-specific layer: hide every non-granted controller from SDL
        // even when bwrap is disabled.
        if !ignore_list.is_empty() {
            env.insert(
                "SDL_GAMECONTROLLER_IGNORE_DEVICES".to_string(),
                ignore_list.to_string(),
            );
        }

        // Geometry hint for the compositor helper.
        let g = plan.geometry;
        env.insert(
            "COOPSPAWN_GEOMETRY".to_string(),
            format!("{},{},{}x{}", g.x, g.y, g.width, g.height),
        );

        if self.profile.goldberg_identity {
            env.insert("SteamAppUser".to_string(), plan.account_id.clone());
            env.insert("SteamUser".to_string(), plan.account_id.clone());
            env.insert("SteamLanguage".to_string(), plan.locale.clone());
            env.insert("GSE_LISTEN_PORT".to_string(), plan.listen_port.to_string());
        } else {
            env.insert("COOPSPAWN_ACCOUNT".to_string(), plan.account_id.clone());
            env.insert("COOPSPAWN_LOCALE".to_string(), plan.locale.clone());
            env.insert("COOPSPAWN_PORT".to_string(), plan.listen_port.to_string());
        }
        env.insert("COOPSPAWN_INSTANCE".to_string(), plan.ordinal.to_string());

        env
    }

    /// bwrap wrapper + optional gamescope wrapper + compat runner + game.
    fn build_argv(&self, plan: &InstancePlan, exe: &Path) -> Vec<String> {
        let mut argv = Vec::new();

        if !self.profile.disable_bwrap {
            argv.extend(
                [
                    "bwrap",
                    "--dev-bind", "/", "/",
                    "--proc", "/proc",
                    "--tmpfs", "/tmp",
                    // Class-level default-deny: the instance starts with an
                    // empty /dev/input and only granted nodes are bound back.
                    "--tmpfs", "/dev/input",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
            for node in &plan.devices {
                let path = node.path.display().to_string();
                argv.push("--dev-bind".to_string());
                argv.push(path.clone());
                argv.push(path);
            }
        }

        if self.profile.use_gamescope {
            argv.extend(self.gamescope_args(plan));
            argv.push("--".to_string());
        }

        if let Some(runtime) = &self.runtime {
            argv.push(runtime.proton.display().to_string());
            argv.push("run".to_string());
        }
        argv.push(exe.display().to_string());
        argv.extend(plan.game_args.iter().cloned());

        argv
    }

    fn gamescope_args(&self, plan: &InstancePlan) -> Vec<String> {
        let g = plan.geometry;
        let mut args: Vec<String> = [
            "gamescope",
            "-e",
            "-W", &g.width.to_string(),
            "-H", &g.height.to_string(),
            "-w", &g.width.to_string(),
            "-h", &g.height.to_string(),
            "-o", "999",
            "-r", "999",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.profile.mode.is_splitscreen() {
            // Borderless so the slots can sit side by side.
            args.push("-b".to_string());
        } else {
            args.push("-f".to_string());
            args.push("--adaptive-sync".to_string());
        }

        // With a dedicated mouse and keyboard the compositor may grab the
        // cursor outright; without both, grabbing would steal shared input.
        if plan.grants(DeviceClass::Mouse) && plan.grants(DeviceClass::Keyboard) {
            args.push("--grab".to_string());
            args.push("--force-grab-cursor".to_string());
        }

        args
    }
}

/// Recursively mirrors `src` into `dst`: directories are recreated, files
/// become symlinks to the originals. Existing entries are left alone.
/// `mirror_root` is skipped so a state root living under the install
/// directory can never make the walk descend into its own output.
fn link_tree(src: &Path, dst: &Path, mirror_root: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        if from == *mirror_root {
            continue;
        }
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            fs::create_dir_all(&to)?;
            link_tree(&from, &to, mirror_root)?;
        } else if fs::symlink_metadata(&to).is_err() {
            std::os::unix::fs::symlink(&from, &to)?;
        }
    }
    Ok(())
}

fn tool_on_path(name: &str) -> bool {
    let Some(path) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&path).any(|dir| dir.join(name).is_file())
}
