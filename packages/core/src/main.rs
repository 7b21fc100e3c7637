use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;

use config_monitor::adapters::mock::{open_role, MockWatcher, OpenPolicyAuditor};
use config_monitor::adapters::Registry;
use config_monitor::api::{self, ApiState};
use config_monitor::cli::{Cli, Command};
use config_monitor::config::Config;
use config_monitor::db;
use config_monitor::error::AppError;
use config_monitor::logging::init_logging;
use config_monitor::metrics::AppMetrics;
use config_monitor::model::NewAccount;
use config_monitor::pipeline::ScanPipeline;
use config_monitor::queue::{run_worker, LocalTaskQueue};
use config_monitor::repository::ResourceRepository;
use config_monitor::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        tracing::error!("{}", err);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = Config::load(&cli).map_err(AppError::Config)?;
    tracing::info!("Starting with config: {:?}", config);

    let pool = db::create_pool(&config.database_url).await?;
    let repo = Arc::new(ResourceRepository::new(pool));
    let metrics = Arc::new(AppMetrics::new()?);
    let registry = Arc::new(build_registry(cli.demo));
    let pipeline = Arc::new(ScanPipeline::new(
        repo.clone(),
        registry.clone(),
        metrics.clone(),
        config.exception_retention(),
    ));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, repo, registry, metrics, pipeline).await,

        Command::Scan { accounts, technologies } => {
            let summary = pipeline.run_scan(&accounts, &technologies).await?;
            for report in &summary.completed {
                tracing::info!(
                    "{}/{}: {} revisions, {} findings, {} fetch errors",
                    report.account,
                    report.technology,
                    report.revisions_created(),
                    report.findings_recorded,
                    report.fetch_errors.len()
                );
            }
            failures_to_error("scan", &summary.failed)
        }

        Command::Audit { accounts } => {
            let summary = pipeline.run_audit(&accounts).await?;
            for report in &summary.completed {
                tracing::info!(
                    "{}/{}: {} audited, {} findings",
                    report.account,
                    report.technology,
                    report.audited,
                    report.findings_recorded
                );
            }
            failures_to_error("audit", &summary.failed)
        }

        Command::ExpireExceptions => {
            let removed = pipeline.expire_exceptions_task().await?;
            tracing::info!("Removed {} expired exception records", removed);
            Ok(())
        }

        Command::AddAccount {
            name,
            identifier,
            account_type,
            third_party,
            inactive,
            notes,
        } => {
            let id = repo
                .insert_account(&NewAccount {
                    identifier,
                    name: name.clone(),
                    account_type,
                    active: !inactive,
                    third_party,
                    notes,
                })
                .await?;
            tracing::info!("Registered account {} (id {})", name, id);
            Ok(())
        }
    }
}

/// Scheduler setup, background worker and HTTP API until Ctrl+C.
async fn serve(
    config: Config,
    repo: Arc<ResourceRepository>,
    registry: Arc<Registry>,
    metrics: Arc<AppMetrics>,
    pipeline: Arc<ScanPipeline>,
) -> Result<(), AppError> {
    let queue = Arc::new(LocalTaskQueue::new());
    Scheduler::new(repo.clone(), registry, queue.clone(), config.schedule())
        .setup()
        .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(run_worker(
        queue,
        pipeline,
        config.worker(),
        wait_for_shutdown(shutdown_rx.clone()),
    ));

    tokio::spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Could not listen for Ctrl+C: {}", err);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let app = api::router(ApiState { repo, metrics });
    let addr = format!("0.0.0.0:{}", config.api_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;

    worker
        .await
        .map_err(|err| AppError::Server(format!("worker task failed: {}", err)))?;
    tracing::info!("Service stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

/// Real watchers and auditors are registered here by the deployments that
/// ship them. `--demo` serves a fixed set of in-memory IAM roles instead.
fn build_registry(demo: bool) -> Registry {
    let mut registry = Registry::new();

    if demo {
        let roles = (0..11).map(|n| open_role("000000000000", n)).collect();
        registry
            .register_watcher(Arc::new(
                MockWatcher::new("iamrole").with_batch_size(3).with_resources(roles),
            ))
            .register_auditor(Arc::new(OpenPolicyAuditor::new("iamrole")));
        tracing::info!("Demo adapters registered for iamrole");
    }

    if registry.is_empty() {
        tracing::warn!("No watchers registered; scans have nothing to run");
    }
    registry
}

fn failures_to_error(kind: &str, failed: &[config_monitor::pipeline::TaskFailure]) -> Result<(), AppError> {
    if failed.is_empty() {
        return Ok(());
    }
    for failure in failed {
        tracing::error!("{} of {}/{} failed: {}", kind, failure.account, failure.technology, failure.error);
    }
    Err(AppError::Task(format!("{} {} tasks failed", failed.len(), kind)))
}
