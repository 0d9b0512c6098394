//! Command-line interface definition.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "coopspawn",
    version,
    about = "Launches and supervises isolated multi-instance co-op sessions of a single game"
)]
pub struct Cli {
    /// Path to the TOML game profile describing the session.
    pub profile: PathBuf,

    /// Also write orchestrator logs to this file.
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// End the whole run as soon as any instance exits.
    #[arg(long)]
    pub abort_on_exit: bool,

    /// Seconds to wait after SIGTERM before escalating to SIGKILL.
    #[arg(long, value_name = "SECONDS", default_value_t = 10)]
    pub grace: u64,

    /// Override the persistent state root (prefixes, run artifacts).
    #[arg(long, value_name = "DIR")]
    pub data_root: Option<PathBuf>,
}

impl Cli {
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}
