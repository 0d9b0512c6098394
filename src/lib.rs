//! coopspawn: instance orchestration and device isolation for local co-op.
//!
//! Launches N isolated instances of one game on a single Linux host, each
//! with its own compatibility prefix, an exclusive slice of the input
//! devices and a pinned rendering surface, then supervises them until the
//! session ends and reverses every transient artifact it created.
//!
//! The pipeline is: load a [`Profile`], snapshot the input device
//! inventory, build per-instance plans, assemble sandboxed launch
//! specifications and hand them to the supervisor. See [`runner::run_profile`]
//! for the single entry point that drives all of it.

pub mod cleanup;
pub mod cli;
pub mod compat;
pub mod errors;
pub mod inventory;
pub mod logging;
pub mod plan;
pub mod profile;
pub mod runner;
pub mod sandbox;
pub mod supervisor;

pub use errors::{CoopSpawnError, Result};
pub use profile::Profile;
pub use runner::{run_profile, RunConfig};
pub use supervisor::{cancel_channel, CancelHandle, ExitPolicy, RunOutcome};

/// Crate-wide defaults.
pub mod defaults {
    use std::time::Duration;

    /// How long a run waits between SIGTERM and SIGKILL during shutdown.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
}
