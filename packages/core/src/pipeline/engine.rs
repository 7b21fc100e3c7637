//! Task bodies: scan, audit and exception expiry.
//!
//! [`ScanPipeline`] is what the execution substrate calls into. Every task
//! records its own failure in the exception store before returning it, so a
//! worker that only logs the `Err` still leaves a durable trace.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;

use crate::adapters::{FetchErrors, Registry, ScanContext, Watcher};
use crate::exceptions::{
    ExceptionStore, ExceptionSubject, EVENT_AUDIT_FAILURE, EVENT_EXPIRY_FAILURE,
    EVENT_FETCH_ERROR, EVENT_WATCH_FAILURE,
};
use crate::metrics::AppMetrics;
use crate::pipeline::audit::AuditTrigger;
use crate::pipeline::detector::ChangeDetector;
use crate::pipeline::error::TaskError;
use crate::pipeline::reconciler::reconcile_orphans;
use crate::pipeline::types::{AuditReport, ChangeKind, ChangedItem, RunSummary, ScanReport, TaskFailure};
use crate::repository::ResourceRepository;
use crate::scheduler::Task;

/// Result of [`ScanPipeline::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Scanned(ScanReport),
    Audited(AuditReport),
    Expired(u64),
}

#[derive(Clone)]
pub struct ScanPipeline {
    repo: Arc<ResourceRepository>,
    registry: Arc<Registry>,
    exceptions: ExceptionStore,
    metrics: Arc<AppMetrics>,
    exception_retention: Duration,
}

impl ScanPipeline {
    pub fn new(
        repo: Arc<ResourceRepository>,
        registry: Arc<Registry>,
        metrics: Arc<AppMetrics>,
        exception_retention: Duration,
    ) -> Self {
        let exceptions = ExceptionStore::new(repo.clone(), metrics.clone());
        Self {
            repo,
            registry,
            exceptions,
            metrics,
            exception_retention,
        }
    }

    pub fn repository(&self) -> &Arc<ResourceRepository> {
        &self.repo
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch one queued task to its body.
    pub async fn execute(&self, task: &Task) -> Result<TaskOutcome, TaskError> {
        match task {
            Task::Scan { account, technology } => {
                self.scan_task(account, technology).await.map(TaskOutcome::Scanned)
            }
            Task::Audit { account, technology } => {
                self.audit_task(account, technology).await.map(TaskOutcome::Audited)
            }
            Task::ExpireExceptions => self.expire_exceptions_task().await.map(TaskOutcome::Expired),
        }
    }

    /// Record a task that panicked inside [`ScanPipeline::execute`], under
    /// the same event type its ordinary failures use.
    pub async fn record_panic(&self, task: &Task, message: &str) {
        let (event_type, at) = match task {
            Task::Scan { account, technology } => {
                self.metrics.scan_task_failures_total.inc();
                (EVENT_WATCH_FAILURE, ExceptionSubject::task(account, technology))
            }
            Task::Audit { account, technology } => {
                self.metrics.audit_task_failures_total.inc();
                (EVENT_AUDIT_FAILURE, ExceptionSubject::task(account, technology))
            }
            Task::ExpireExceptions => (EVENT_EXPIRY_FAILURE, ExceptionSubject::default()),
        };
        tracing::error!("{} panicked: {}", task, message);
        self.exceptions
            .store_message(event_type, &at, &format!("Task panicked: {}", message))
            .await;
    }

    /// Fetch, diff, reconcile and audit one (account, technology) pair.
    pub async fn scan_task(&self, account: &str, technology: &str) -> Result<ScanReport, TaskError> {
        self.metrics.scan_tasks_total.inc();
        let started = Instant::now();

        let result = self.scan(account, technology).await;
        self.metrics.scan_duration.observe(started.elapsed().as_secs_f64());

        if let Err(err) = &result {
            self.metrics.scan_task_failures_total.inc();
            tracing::error!("Scan of {}/{} failed: {}", account, technology, err.detail());
            self.exceptions
                .store(EVENT_WATCH_FAILURE, &ExceptionSubject::task(account, technology), err)
                .await;
        }
        result
    }

    /// Catch-up audit: every latest revision with no findings yet.
    pub async fn audit_task(&self, account: &str, technology: &str) -> Result<AuditReport, TaskError> {
        self.metrics.audit_tasks_total.inc();

        let result = self.audit(account, technology).await;
        if let Err(err) = &result {
            self.metrics.audit_task_failures_total.inc();
            tracing::error!("Audit of {}/{} failed: {}", account, technology, err.detail());
            self.exceptions
                .store(EVENT_AUDIT_FAILURE, &ExceptionSubject::task(account, technology), err)
                .await;
        }
        result
    }

    /// Drop exception records older than the configured retention.
    pub async fn expire_exceptions_task(&self) -> Result<u64, TaskError> {
        match self.exceptions.clear_expired(self.exception_retention).await {
            Ok(removed) => Ok(removed),
            Err(err) => {
                let err = TaskError::from(err);
                tracing::error!("Exception expiry failed: {}", err.detail());
                self.exceptions
                    .store(EVENT_EXPIRY_FAILURE, &ExceptionSubject::default(), &err)
                    .await;
                Err(err)
            }
        }
    }

    /// Manual scan of `accounts` x `technologies`. Empty lists mean every
    /// schedulable account and every registered technology. A failing pair
    /// is reported and the rest still run.
    pub async fn run_scan(
        &self,
        accounts: &[String],
        technologies: &[String],
    ) -> Result<RunSummary<ScanReport>, TaskError> {
        let accounts = self.resolve_accounts(accounts).await?;
        let technologies: Vec<String> = if technologies.is_empty() {
            self.registry.technologies().into_iter().map(str::to_string).collect()
        } else {
            technologies.to_vec()
        };

        let mut summary = RunSummary::default();
        for account in &accounts {
            for technology in &technologies {
                match self.scan_task(account, technology).await {
                    Ok(report) => summary.completed.push(report),
                    Err(err) => summary.failed.push(failure(account, technology, &err)),
                }
            }
        }
        Ok(summary)
    }

    /// Manual catch-up audit of every audit category for `accounts`.
    pub async fn run_audit(&self, accounts: &[String]) -> Result<RunSummary<AuditReport>, TaskError> {
        let accounts = self.resolve_accounts(accounts).await?;
        let categories: Vec<String> = self
            .registry
            .audit_categories()
            .into_iter()
            .map(str::to_string)
            .collect();

        let mut summary = RunSummary::default();
        for account in &accounts {
            for technology in &categories {
                match self.audit_task(account, technology).await {
                    Ok(report) => summary.completed.push(report),
                    Err(err) => summary.failed.push(failure(account, technology, &err)),
                }
            }
        }
        Ok(summary)
    }

    async fn resolve_accounts(&self, accounts: &[String]) -> Result<Vec<String>, TaskError> {
        if !accounts.is_empty() {
            return Ok(accounts.to_vec());
        }
        Ok(self
            .repo
            .schedulable_accounts()
            .await?
            .into_iter()
            .map(|account| account.name)
            .collect())
    }

    async fn context(&self, account: &str, technology: &str) -> Result<ScanContext, TaskError> {
        let account = self
            .repo
            .account_by_name(account)
            .await?
            .ok_or_else(|| TaskError::unknown_account(account))?;
        let technology = self.repo.technology(technology).await?;
        Ok(ScanContext::new(account, technology))
    }

    async fn scan(&self, account: &str, technology: &str) -> Result<ScanReport, TaskError> {
        let watcher = self
            .registry
            .watcher(technology)
            .ok_or_else(|| TaskError::unknown_technology(technology))?;
        let ctx = self.context(account, technology).await?;

        let mut report = ScanReport::new(&ctx);
        let mut detector = ChangeDetector::load(&self.repo, &ctx).await?;
        let mut errors = FetchErrors::new();
        let mut delta: Vec<ChangedItem> = Vec::new();

        let complete = fetch_and_detect(
            watcher.as_ref(),
            &ctx,
            &mut detector,
            &mut errors,
            &mut delta,
            &mut report,
        )
        .await?;
        report.listing_aborted = !complete;

        self.record_fetch_errors(&ctx, &errors, &mut report).await;

        if complete {
            delta.extend(detector.find_deleted(&errors).await?);
        } else {
            tracing::warn!("{}: listing incomplete, skipping deletion detection", ctx);
        }
        report.observed = detector.observed();
        report.count(&delta);

        let repaired = reconcile_orphans(&self.repo, &ctx).await?;
        report.orphans_repaired = repaired.len();
        self.metrics.orphans_repaired_total.inc_by(repaired.len() as f64);

        self.count_revisions(&report);

        let targets: Vec<_> = delta.iter().map(ChangedItem::audit_target).collect();
        let outcome = AuditTrigger::new(&self.repo, self.registry.auditors(technology))
            .run(&ctx, &targets)
            .await?;
        report.audited = outcome.audited;
        report.findings_recorded = outcome.findings_recorded;
        self.metrics.findings_recorded_total.inc_by(outcome.findings_recorded as f64);

        tracing::info!(
            "{}: {} observed, {} created, {} modified, {} deleted, {} orphans, {} findings",
            ctx,
            report.observed,
            report.created,
            report.modified,
            report.deleted,
            report.orphans_repaired,
            report.findings_recorded
        );
        Ok(report)
    }

    async fn audit(&self, account: &str, technology: &str) -> Result<AuditReport, TaskError> {
        let auditors = self.registry.auditors(technology);
        if auditors.is_empty() {
            return Err(TaskError::NoAuditor {
                technology: technology.to_string(),
            });
        }
        let ctx = self.context(account, technology).await?;

        let targets = self
            .repo
            .unaudited_targets(ctx.account.id, ctx.technology.id)
            .await?;
        let outcome = AuditTrigger::new(&self.repo, auditors).run(&ctx, &targets).await?;
        self.metrics.findings_recorded_total.inc_by(outcome.findings_recorded as f64);

        tracing::info!(
            "{}: catch-up audit of {} items, {} findings",
            ctx,
            outcome.audited,
            outcome.findings_recorded
        );
        Ok(AuditReport {
            account: ctx.account.name,
            technology: ctx.technology.name,
            audited: outcome.audited,
            findings_recorded: outcome.findings_recorded,
        })
    }

    async fn record_fetch_errors(&self, ctx: &ScanContext, errors: &FetchErrors, report: &mut ScanReport) {
        if errors.is_empty() {
            return;
        }
        tracing::warn!("{}: {} fetch errors", ctx, errors.len());
        self.metrics.fetch_errors_total.inc_by(errors.len() as f64);

        for (subject, message) in errors.iter() {
            let at = ExceptionSubject::task(&ctx.account.name, &ctx.technology.name)
                .with_subject(subject.to_string());
            self.exceptions.store_message(EVENT_FETCH_ERROR, &at, message).await;
            report.fetch_errors.push(format!("{}: {}", subject, message));
        }
    }

    fn count_revisions(&self, report: &ScanReport) {
        let by_kind = [
            (ChangeKind::Created.as_str(), report.created),
            (ChangeKind::Modified.as_str(), report.modified),
            (ChangeKind::Deleted.as_str(), report.deleted),
            ("orphan", report.orphans_repaired),
        ];
        for (kind, count) in by_kind {
            if count > 0 {
                self.metrics
                    .revisions_created_total
                    .with_label_values(&[kind])
                    .inc_by(count as f64);
            }
        }
    }
}

/// Pull the snapshot through the detector. Returns `false` when a batched
/// listing reported errors, in which case nothing was fetched.
async fn fetch_and_detect(
    watcher: &dyn Watcher,
    ctx: &ScanContext,
    detector: &mut ChangeDetector<'_>,
    errors: &mut FetchErrors,
    delta: &mut Vec<ChangedItem>,
    report: &mut ScanReport,
) -> Result<bool, TaskError> {
    let batch_size = watcher.batch_size();

    if batch_size == 0 {
        let snapshot = watcher.slurp(ctx).await?;
        report.fetch_calls += 1;
        errors.extend(snapshot.errors);
        delta.extend(detector.find_changes_batch(&snapshot.items).await?);
        return Ok(true);
    }

    let listing = watcher.slurp_list(ctx).await?;
    report.fetch_calls += 1;
    if !listing.errors.is_empty() {
        errors.extend(listing.errors);
        return Ok(false);
    }

    tracing::debug!(
        "{}: {} subjects listed, fetching in batches of {}",
        ctx,
        listing.subjects.len(),
        batch_size
    );
    for chunk in listing.subjects.chunks(batch_size) {
        let snapshot = watcher.slurp_batch(ctx, chunk).await?;
        report.fetch_calls += 1;
        errors.extend(snapshot.errors);
        delta.extend(detector.find_changes_batch(&snapshot.items).await?);
    }
    Ok(true)
}

fn failure(account: &str, technology: &str, err: &TaskError) -> TaskFailure {
    TaskFailure {
        account: account.to_string(),
        technology: technology.to_string(),
        error: err.detail(),
    }
}
