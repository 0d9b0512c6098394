//! Centralized error handling for coopspawn
//!
//! This module provides a unified error type that wraps the error types
//! used by the individual subsystems, so callers can propagate everything
//! with `?` and match on the category at the top level.

use std::io;
use thiserror::Error;

/// Main error type for the coopspawn orchestration engine
#[derive(Error, Debug)]
pub enum CoopSpawnError {
    #[error("Profile error: {0}")]
    Profile(#[from] crate::profile::ProfileError),

    #[error("Device inventory error: {0}")]
    Inventory(#[from] crate::inventory::InventoryError),

    #[error("Plan error: {0}")]
    Plan(#[from] crate::plan::PlanError),

    #[error("Compatibility layer error: {0}")]
    Compat(#[from] crate::compat::CompatError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] crate::sandbox::SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Application error: {0}")]
    Application(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, CoopSpawnError>;

impl CoopSpawnError {
    /// Create a new application error
    pub fn application(msg: impl Into<String>) -> Self {
        CoopSpawnError::Application(msg.into())
    }
}
