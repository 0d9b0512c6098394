//! Multi-output logging setup: stdout always, plus an optional file sink.

use log::LevelFilter;
use std::path::Path;
use std::time::SystemTime;

/// Initializes the global logger. Instance output goes to per-instance log
/// files managed by the supervisor; this logger only carries the
/// orchestrator's own records.
pub fn init(level: LevelFilter, log_file: Option<&Path>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stdout());

    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
