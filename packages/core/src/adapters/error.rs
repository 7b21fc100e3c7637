//! Error types returned by watcher and auditor adapters

use thiserror::Error;

/// Errors from a watcher call as a whole.
///
/// Per-resource failures do not use this type; they are reported through
/// [`crate::adapters::FetchErrors`] alongside the successfully fetched items.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Data format error: {message}")]
    Format { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Watcher {watcher} does not support batched fetching")]
    BatchingUnsupported { watcher: String },
}

/// Errors from an auditor run.
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Rule {rule_id} failed: {message}")]
    Rule { rule_id: String, message: String },

    #[error("Malformed configuration for {subject}: {message}")]
    Config { subject: String, message: String },
}

impl WatchError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::Format { message: message.into() }
    }
}
