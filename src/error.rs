//! Fatal error taxonomy for the run engine.
//!
//! Per-item failures (transport or parse) are never represented here: they
//! are turned into errored result rows by the item processor. Everything in
//! [`EngineError`] terminates the current command with a non-zero exit.
//!
//! Command code works in `anyhow::Result`; callers that need to branch on
//! the kind use `err.downcast_ref::<EngineError>()`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or missing run parameters. Raised before any run row exists.
    #[error("configuration error: {0}")]
    Config(String),

    /// The corpus slice a run was created over has changed since creation.
    #[error(
        "integrity check failed for run {run_id}: corpus checksum {actual} does not match recorded {expected}"
    )]
    Integrity {
        run_id: String,
        expected: String,
        actual: String,
    },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("run {0} is completed and cannot be resumed")]
    RunCompleted(String),

    #[error("run {run_id} is in state '{status}', expected 'running'")]
    InvalidTransition { run_id: String, status: String },

    /// Another live process holds the run's lock file.
    #[error("run {run_id} is locked by live process {pid} ({})", path.display())]
    Locked {
        run_id: String,
        pid: u32,
        path: PathBuf,
    },

    /// The lock file exists but cannot be parsed and was written moments ago,
    /// so its writer may still be finishing.
    #[error("run {run_id} lock file {} is unreadable and recent; try again shortly", path.display())]
    LockUnreadable { run_id: String, path: PathBuf },

    /// A result row already exists for this key and may not be replaced.
    #[error("result already recorded for run {run_id}, item {entity_id}/{subtype}")]
    DuplicateResult {
        run_id: String,
        entity_id: String,
        subtype: String,
    },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::Config(msg.into())
    }
}
