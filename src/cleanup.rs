//! Cleanup coordinator
//!
//! Every transient artifact the assembler creates is registered here at
//! creation time, so release is guaranteed on every exit path. The
//! coordinator drains the registry under its lock, which makes the reversal
//! exactly-once: a second invocation sees an empty registry and does
//! nothing. Failures are collected and reported, never raised, so they can
//! never mask the run's primary outcome.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A transient filesystem artifact created for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientResource {
    /// Controller blacklist written for one instance.
    BlacklistFile(PathBuf),
    /// Lock marking a prefix as in use by a live run.
    PrefixLock(PathBuf),
}

impl TransientResource {
    pub fn path(&self) -> &Path {
        match self {
            TransientResource::BlacklistFile(path) => path,
            TransientResource::PrefixLock(path) => path,
        }
    }
}

impl fmt::Display for TransientResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientResource::BlacklistFile(path) => {
                write!(f, "blacklist file {}", path.display())
            }
            TransientResource::PrefixLock(path) => write!(f, "prefix lock {}", path.display()),
        }
    }
}

/// Ordered record of the transient resources created so far. Insertion
/// order is creation order; cleanup walks it in reverse.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    resources: Vec<TransientResource>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource. Re-registering the same path (an idempotent
    /// re-assembly overwrites its artifacts) is a no-op.
    pub fn register(&mut self, resource: TransientResource) {
        if self.resources.iter().any(|r| r.path() == resource.path()) {
            log::debug!("Resource already registered: {}", resource);
            return;
        }
        log::debug!("Registered transient resource: {}", resource);
        self.resources.push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn drain_reversed(&mut self) -> Vec<TransientResource> {
        let mut drained = std::mem::take(&mut self.resources);
        drained.reverse();
        drained
    }
}

/// Outcome of one cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub removed: usize,
    pub failures: Vec<(TransientResource, io::Error)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reverses every registered transient resource, newest first.
///
/// Persistent artifacts the profile asked to keep (prefixes, saves, logs)
/// are never registered and therefore never touched here.
pub fn run(registry: &Mutex<ResourceRegistry>) -> CleanupReport {
    let resources = match registry.lock() {
        Ok(mut registry) => registry.drain_reversed(),
        Err(poisoned) => poisoned.into_inner().drain_reversed(),
    };

    if resources.is_empty() {
        log::debug!("Cleanup: nothing to reverse");
        return CleanupReport::default();
    }

    log::info!("Cleaning up {} transient resources", resources.len());
    let mut report = CleanupReport::default();
    for resource in resources {
        match fs::remove_file(resource.path()) {
            Ok(()) => {
                log::debug!("Removed {}", resource);
                report.removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Already gone; the end state is what was asked for.
                report.removed += 1;
            }
            Err(e) => {
                log::warn!("Failed to remove {}: {}", resource, e);
                report.failures.push((resource, e));
            }
        }
    }

    if !report.is_clean() {
        log::warn!(
            "Cleanup finished with {} failures ({} removed)",
            report.failures.len(),
            report.removed
        );
    } else {
        log::info!("Cleanup complete ({} removed)", report.removed);
    }
    report
}
