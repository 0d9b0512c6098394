//! Orchestration entry point
//!
//! `run_profile` drives one complete run: snapshot the device inventory,
//! build the instance plans, assemble every sandbox, supervise the
//! instances to completion and reverse all transient state. The cleanup
//! coordinator runs on every exit path — normal completion, any failure
//! and cancellation — and its own failures never mask the primary outcome.

use crate::cleanup::{self, ResourceRegistry};
use crate::errors::Result;
use crate::inventory;
use crate::plan;
use crate::profile::Profile;
use crate::sandbox::Assembler;
use crate::supervisor::{ExitPolicy, RunOutcome, RunState, Supervisor};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

pub use crate::supervisor::{cancel_channel, CancelHandle};

/// Per-run knobs that are not part of the profile.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Persistent state root; prefixes live under it, run artifacts under
    /// `<data_root>/runs/<game>-<pid>`.
    pub data_root: PathBuf,
    pub policy: ExitPolicy,
    /// Bound on the cooperative phase of shutdown.
    pub grace: Duration,
}

impl RunConfig {
    pub fn new(data_root: PathBuf) -> Self {
        RunConfig {
            data_root,
            policy: ExitPolicy::default(),
            grace: crate::defaults::SHUTDOWN_GRACE,
        }
    }
}

/// Default persistent state root, `~/.local/share/coopspawn`.
pub fn default_data_root() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("coopspawn"))
        .ok_or_else(|| crate::errors::CoopSpawnError::application("could not determine data directory"))
}

/// Runs one orchestration across all instances of `profile`.
///
/// Configuration errors (device conflicts, prefix collisions, missing
/// bindings) surface before any process is launched. Once supervision has
/// started the call only returns after every instance is terminal.
pub async fn run_profile(
    profile: &Profile,
    config: &RunConfig,
    cancel_rx: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    log::info!(
        "Starting run of '{}' with {} players",
        profile.game_name,
        profile.players.len()
    );

    let snapshot = inventory::resolve()?;
    let plans = plan::build(profile, &snapshot, &config.data_root)?;

    let run_dir = config
        .data_root
        .join("runs")
        .join(format!("{}-{}", profile.game_name, std::process::id()));
    fs::create_dir_all(&run_dir)?;

    let registry = Mutex::new(ResourceRegistry::new());
    let assembler = Assembler::new(profile, &snapshot, run_dir)?;

    let mut specs = Vec::with_capacity(plans.len());
    for plan in &plans {
        let assembled = {
            let mut registry = registry.lock().unwrap_or_else(|p| p.into_inner());
            assembler.assemble(plan, &mut registry)
        };
        match assembled {
            Ok(spec) => specs.push(spec),
            Err(e) => {
                // Abort before launch; artifacts from earlier instances are
                // already registered and must still be reversed.
                log::error!("Sandbox construction failed for instance {}: {}", plan.ordinal, e);
                cleanup::run(&registry);
                return Err(e.into());
            }
        }
    }

    let state = Arc::new(Mutex::new(RunState::new(specs.len())));
    let supervisor = Supervisor::new(config.policy, config.grace);
    let outcome = supervisor.run(specs, Arc::clone(&state), cancel_rx).await;

    let report = cleanup::run(&registry);
    if !report.is_clean() {
        log::warn!(
            "Run finished but {} transient resources could not be removed",
            report.failures.len()
        );
    }

    match &outcome {
        RunOutcome::AllCompleted(outcomes) => {
            log::info!("Run complete: {:?}", outcomes)
        }
        RunOutcome::AbortedByFailure { instance, error } => {
            log::error!("Run aborted by instance {}: {}", instance, error)
        }
        RunOutcome::Cancelled => log::info!("Run cancelled"),
    }
    Ok(outcome)
}
