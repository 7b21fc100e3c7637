//! Error types for pipeline tasks

use thiserror::Error;

use crate::adapters::{AuditError, WatchError};

/// Anything that escapes a scan, audit or housekeeping task.
///
/// Tasks record these in the exception store before returning them, so the
/// execution substrate sees the original error after it is already visible
/// locally.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Unknown account: {name}")]
    UnknownAccount { name: String },

    #[error("No watcher registered for technology: {technology}")]
    UnknownTechnology { technology: String },

    #[error("No auditor registered for technology: {technology}")]
    NoAuditor { technology: String },

    #[error("Watcher failed")]
    Watch(#[from] WatchError),

    #[error("Auditor failed")]
    Audit(#[from] AuditError),

    #[error("Storage error")]
    Storage(#[from] sqlx::Error),
}

impl TaskError {
    pub fn unknown_account(name: impl Into<String>) -> Self {
        Self::UnknownAccount { name: name.into() }
    }

    pub fn unknown_technology(technology: impl Into<String>) -> Self {
        Self::UnknownTechnology { technology: technology.into() }
    }

    /// The message together with its underlying cause.
    pub fn detail(&self) -> String {
        crate::exceptions::render_chain(self)
    }
}
