//! Prometheus metrics registry for the config monitor.
//!
//! [`AppMetrics`] owns all registered metrics and the [`Registry`] they
//! belong to. Construct it once at startup, wrap in `Arc`, and hand it to
//! the pipeline, the exception store and the HTTP layer.
//!
//! Exposed at `GET /metrics` in Prometheus text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};

/// All application-level Prometheus metrics.
pub struct AppMetrics {
    /// Scan tasks started.
    pub scan_tasks_total: Counter,
    /// Scan tasks that ended in an error.
    pub scan_task_failures_total: Counter,
    /// Audit tasks started (catch-up path only).
    pub audit_tasks_total: Counter,
    /// Audit tasks that ended in an error.
    pub audit_task_failures_total: Counter,
    /// Revisions written, labelled by kind (created, modified, deleted, orphan).
    pub revisions_created_total: CounterVec,
    /// Findings persisted by either audit path.
    pub findings_recorded_total: Counter,
    /// Per-resource fetch errors reported by watchers.
    pub fetch_errors_total: Counter,
    /// Orphaned items repaired by the reconciler.
    pub orphans_repaired_total: Counter,
    /// Exception records written, labelled by event type.
    pub exceptions_recorded_total: CounterVec,
    /// Exception records removed by the retention sweep.
    pub exceptions_expired_total: Counter,
    /// Wall-clock duration of scan tasks in seconds.
    pub scan_duration: Histogram,
    /// HTTP request count, labelled by method, path, and status code.
    pub http_requests_total: CounterVec,
    /// The registry that owns all of the above metrics.
    pub registry: Registry,
}

const PREFIX: &str = "config_monitor";

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(format!("{}_{}", PREFIX, name), help)
}

impl AppMetrics {
    /// Create and register all metrics. Returns an error if any metric
    /// name is invalid or duplicated.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let scan_tasks_total = Counter::with_opts(opts("scan_tasks_total", "Scan tasks started"))?;
        let scan_task_failures_total = Counter::with_opts(opts(
            "scan_task_failures_total",
            "Scan tasks that failed",
        ))?;
        let audit_tasks_total =
            Counter::with_opts(opts("audit_tasks_total", "Audit tasks started"))?;
        let audit_task_failures_total = Counter::with_opts(opts(
            "audit_task_failures_total",
            "Audit tasks that failed",
        ))?;
        let revisions_created_total = CounterVec::new(
            opts("revisions_created_total", "Revisions written by kind"),
            &["kind"],
        )?;
        let findings_recorded_total = Counter::with_opts(opts(
            "findings_recorded_total",
            "Audit findings persisted",
        ))?;
        let fetch_errors_total = Counter::with_opts(opts(
            "fetch_errors_total",
            "Per-resource fetch errors reported by watchers",
        ))?;
        let orphans_repaired_total = Counter::with_opts(opts(
            "orphans_repaired_total",
            "Orphaned items given a deletion marker",
        ))?;
        let exceptions_recorded_total = CounterVec::new(
            opts("exceptions_recorded_total", "Exception records written by event type"),
            &["event_type"],
        )?;
        let exceptions_expired_total = Counter::with_opts(opts(
            "exceptions_expired_total",
            "Exception records removed by retention",
        ))?;
        let scan_duration = Histogram::with_opts(
            HistogramOpts::new(
                format!("{}_scan_duration_seconds", PREFIX),
                "Scan task duration in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        )?;
        let http_requests_total = CounterVec::new(
            opts("http_requests_total", "HTTP requests by method, path, and status"),
            &["method", "path", "status"],
        )?;

        registry.register(Box::new(scan_tasks_total.clone()))?;
        registry.register(Box::new(scan_task_failures_total.clone()))?;
        registry.register(Box::new(audit_tasks_total.clone()))?;
        registry.register(Box::new(audit_task_failures_total.clone()))?;
        registry.register(Box::new(revisions_created_total.clone()))?;
        registry.register(Box::new(findings_recorded_total.clone()))?;
        registry.register(Box::new(fetch_errors_total.clone()))?;
        registry.register(Box::new(orphans_repaired_total.clone()))?;
        registry.register(Box::new(exceptions_recorded_total.clone()))?;
        registry.register(Box::new(exceptions_expired_total.clone()))?;
        registry.register(Box::new(scan_duration.clone()))?;
        registry.register(Box::new(http_requests_total.clone()))?;

        Ok(Self {
            scan_tasks_total,
            scan_task_failures_total,
            audit_tasks_total,
            audit_task_failures_total,
            revisions_created_total,
            findings_recorded_total,
            fetch_errors_total,
            orphans_repaired_total,
            exceptions_recorded_total,
            exceptions_expired_total,
            scan_duration,
            http_requests_total,
            registry,
        })
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
