//! Task scheduler.
//!
//! At startup the scheduler purges whatever an earlier process left queued,
//! computes the work matrix from the schedulable accounts and the adapter
//! registry, then hands every unit to the [`TaskQueue`]: scans are enqueued
//! immediately and registered as periodic, audits are registered as periodic
//! only, and one housekeeping task expires old exception records.
//!
//! Queue operations are keyed by [`Task`], so running setup twice overwrites
//! the same periodic entries instead of stacking them.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::Registry;
use crate::model::Account;
use crate::repository::ResourceRepository;

/// One unit of work understood by the execution substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    Scan { account: String, technology: String },
    Audit { account: String, technology: String },
    ExpireExceptions,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Scan { account, technology } => write!(f, "scan:{}/{}", account, technology),
            Task::Audit { account, technology } => write!(f, "audit:{}/{}", account, technology),
            Task::ExpireExceptions => write!(f, "expire-exceptions"),
        }
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,

    #[error("Invalid schedule for {task}: {reason}")]
    InvalidSchedule { task: String, reason: String },
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Could not load accounts: {0}")]
    Accounts(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// The execution substrate as seen by the scheduler.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue `task` for immediate execution. A task already pending is not
    /// queued twice.
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Run `task` every `every`. Re-registering a task replaces its entry.
    async fn schedule_periodic(&self, task: Task, every: Duration) -> Result<(), QueueError>;

    /// Drop every queued-but-not-started task. Returns how many were dropped.
    async fn purge_pending(&self) -> Result<usize, QueueError>;
}

/// One (account, technology) pair plus how often to scan it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub account: String,
    pub technology: String,
    pub interval: Option<Duration>,
}

/// Scan and audit work for one set of accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkMatrix {
    pub scans: Vec<WorkUnit>,
    pub audits: Vec<WorkUnit>,
}

impl WorkMatrix {
    /// Cross schedulable `accounts` with the registry's technologies and
    /// audit categories. Inactive and third-party accounts are skipped.
    pub fn build(accounts: &[Account], registry: &Registry) -> Self {
        let mut matrix = WorkMatrix::default();

        for account in accounts.iter().filter(|a| a.is_schedulable()) {
            for technology in registry.technologies() {
                matrix.scans.push(WorkUnit {
                    account: account.name.clone(),
                    technology: technology.to_string(),
                    interval: registry.watcher(technology).and_then(|w| w.interval()),
                });
            }
            for category in registry.audit_categories() {
                matrix.audits.push(WorkUnit {
                    account: account.name.clone(),
                    technology: category.to_string(),
                    interval: None,
                });
            }
        }

        matrix
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub scan_interval: Duration,
    pub audit_interval: Duration,
    pub exception_sweep_interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(900),
            audit_interval: Duration::from_secs(86_400),
            exception_sweep_interval: Duration::from_secs(3_600),
        }
    }
}

/// What one [`Scheduler::setup`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupReport {
    pub purged: usize,
    pub scans: usize,
    pub audits: usize,
    pub failures: usize,
}

pub struct Scheduler {
    repo: Arc<ResourceRepository>,
    registry: Arc<Registry>,
    queue: Arc<dyn TaskQueue>,
    config: ScheduleConfig,
}

impl Scheduler {
    pub fn new(
        repo: Arc<ResourceRepository>,
        registry: Arc<Registry>,
        queue: Arc<dyn TaskQueue>,
        config: ScheduleConfig,
    ) -> Self {
        Self {
            repo,
            registry,
            queue,
            config,
        }
    }

    /// Purge, compute the work matrix and dispatch it.
    ///
    /// A unit the queue refuses is logged and counted; the remaining units
    /// are still dispatched.
    pub async fn setup(&self) -> Result<SetupReport, SchedulerError> {
        let purged = self.queue.purge_pending().await?;
        if purged > 0 {
            tracing::info!("Purged {} pending tasks", purged);
        }

        let accounts = self.repo.schedulable_accounts().await?;
        let matrix = WorkMatrix::build(&accounts, &self.registry);
        let mut report = SetupReport {
            purged,
            ..SetupReport::default()
        };

        for unit in &matrix.scans {
            let task = Task::Scan {
                account: unit.account.clone(),
                technology: unit.technology.clone(),
            };
            let every = unit.interval.unwrap_or(self.config.scan_interval);
            match self.dispatch_scan(task.clone(), every).await {
                Ok(()) => report.scans += 1,
                Err(err) => {
                    tracing::error!("Could not schedule {}: {}", task, err);
                    report.failures += 1;
                }
            }
        }

        for unit in &matrix.audits {
            let task = Task::Audit {
                account: unit.account.clone(),
                technology: unit.technology.clone(),
            };
            match self.queue.schedule_periodic(task.clone(), self.config.audit_interval).await {
                Ok(()) => report.audits += 1,
                Err(err) => {
                    tracing::error!("Could not schedule {}: {}", task, err);
                    report.failures += 1;
                }
            }
        }

        self.queue
            .schedule_periodic(Task::ExpireExceptions, self.config.exception_sweep_interval)
            .await?;

        tracing::info!(
            "Scheduled {} scans and {} audits across {} accounts",
            report.scans,
            report.audits,
            accounts.len()
        );
        Ok(report)
    }

    async fn dispatch_scan(&self, task: Task, every: Duration) -> Result<(), QueueError> {
        self.queue.enqueue(task.clone()).await?;
        self.queue.schedule_periodic(task, every).await
    }
}
