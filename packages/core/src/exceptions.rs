//! Diagnostic exception log.
//!
//! Every failure that escapes a task, and every per-resource fetch error a
//! watcher reports, is written here with enough context to find it again.
//! Recording must never turn into a second failure: if the write itself
//! fails, the original error is logged and the caller carries on.

use std::error::Error;
use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::metrics::AppMetrics;
use crate::repository::ResourceRepository;

/// Event type for failures escaping a scan task.
pub const EVENT_WATCH_FAILURE: &str = "scheduler-exception-on-watch";
/// Event type for failures escaping an audit task.
pub const EVENT_AUDIT_FAILURE: &str = "scheduler-exception-on-audit";
/// Event type for per-resource fetch errors.
pub const EVENT_FETCH_ERROR: &str = "watcher-fetch-error";
/// Event type for failures of the retention sweep itself.
pub const EVENT_EXPIRY_FAILURE: &str = "scheduler-exception-on-expiry";

/// Where an exception happened. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExceptionSubject {
    pub account: Option<String>,
    pub technology: Option<String>,
    pub subject: Option<String>,
}

impl ExceptionSubject {
    pub fn task(account: &str, technology: &str) -> Self {
        Self {
            account: Some(account.to_string()),
            technology: Some(technology.to_string()),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[derive(Clone)]
pub struct ExceptionStore {
    repo: Arc<ResourceRepository>,
    metrics: Arc<AppMetrics>,
}

impl ExceptionStore {
    pub fn new(repo: Arc<ResourceRepository>, metrics: Arc<AppMetrics>) -> Self {
        Self { repo, metrics }
    }

    /// Record `error` and its source chain. Never fails.
    pub async fn store(
        &self,
        event_type: &str,
        at: &ExceptionSubject,
        error: &(dyn Error + Send + Sync + 'static),
    ) {
        self.store_message(event_type, at, &render_chain(error)).await;
    }

    /// Record an error that only exists as text, such as a watcher's
    /// per-resource failure message. Never fails.
    pub async fn store_message(&self, event_type: &str, at: &ExceptionSubject, message: &str) {
        let result = self
            .repo
            .insert_exception(
                event_type,
                at.account.as_deref(),
                at.technology.as_deref(),
                at.subject.as_deref(),
                message,
                Utc::now(),
            )
            .await;

        match result {
            Ok(_) => {
                self.metrics
                    .exceptions_recorded_total
                    .with_label_values(&[event_type])
                    .inc();
            }
            Err(write_err) => {
                tracing::error!(
                    "Could not record {} exception ({}): {}; original error: {}",
                    event_type,
                    write_err,
                    describe(at),
                    message
                );
            }
        }
    }

    /// Delete records older than `retention`. Returns rows removed.
    pub async fn clear_expired(&self, retention: Duration) -> Result<u64, sqlx::Error> {
        let cutoff = Utc::now() - retention;
        let removed = self.repo.delete_exceptions_before(cutoff).await?;
        if removed > 0 {
            tracing::info!("Expired {} exception records older than {}", removed, cutoff.to_rfc3339());
        }
        self.metrics.exceptions_expired_total.inc_by(removed as f64);
        Ok(removed)
    }
}

/// `error` followed by each of its sources, joined with `": "`.
pub fn render_chain(error: &(dyn Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

fn describe(at: &ExceptionSubject) -> String {
    [&at.account, &at.technology, &at.subject]
        .iter()
        .filter_map(|part| part.as_deref())
        .collect::<Vec<_>>()
        .join("/")
}
