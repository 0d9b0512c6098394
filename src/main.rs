use anyhow::Context;
use clap::Parser;
use coopspawn::cli::Cli;
use coopspawn::supervisor::{ExitPolicy, RunOutcome};
use coopspawn::{cancel_channel, logging, profile::Profile, runner, RunConfig};
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(cli.log_level(), cli.log_file.as_deref())
        .context("failed to initialize logging")?;

    let profile = Profile::load(&cli.profile)
        .with_context(|| format!("failed to load profile {}", cli.profile.display()))?;

    let data_root = match cli.data_root.clone() {
        Some(root) => root,
        None => runner::default_data_root()?,
    };
    let mut config = RunConfig::new(data_root);
    config.grace = Duration::from_secs(cli.grace);
    if cli.abort_on_exit {
        config.policy = ExitPolicy::AnyExitEndsRun;
    }

    let (handle, cancel_rx) = cancel_channel();
    ctrlc::set_handler(move || {
        log::info!("Ctrl+C received, shutting down");
        handle.cancel();
    })
    .context("failed to install Ctrl+C handler")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    let outcome = runtime.block_on(runner::run_profile(&profile, &config, cancel_rx))?;

    match outcome {
        RunOutcome::AllCompleted(outcomes) => {
            let failed = outcomes
                .iter()
                .filter(|o| !matches!(o, coopspawn::supervisor::InstanceOutcome::Exited(0)))
                .count();
            if failed > 0 {
                log::warn!("{} of {} instances did not exit cleanly", failed, outcomes.len());
                std::process::exit(1);
            }
        }
        RunOutcome::AbortedByFailure { instance, error } => {
            log::error!("Run aborted: instance {} failed: {}", instance, error);
            std::process::exit(1);
        }
        RunOutcome::Cancelled => {
            log::info!("Run cancelled; all instances terminated");
        }
    }
    Ok(())
}
