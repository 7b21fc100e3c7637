//! End-to-end scan scenarios.
//!
//! Each test wires the real pipeline (in-memory SQLite, registry, metrics)
//! to the in-memory mock watcher and auditor, then drives it through the
//! same entry points the worker uses.

use std::sync::Arc;

use chrono::Duration;
use proptest::prelude::*;

use config_monitor::adapters::mock::{open_role, MockWatcher, OpenPolicyAuditor};
use config_monitor::adapters::{FetchSubject, Registry};
use config_monitor::db;
use config_monitor::exceptions::{EVENT_FETCH_ERROR, EVENT_WATCH_FAILURE};
use config_monitor::metrics::AppMetrics;
use config_monitor::model::NewAccount;
use config_monitor::pipeline::{ScanPipeline, TaskError};
use config_monitor::repository::ResourceRepository;
use config_monitor::scheduler::Task;

const ACCOUNT: &str = "TEST_ACCOUNT1";
const IDENTIFIER: &str = "012345678910";

// ---- Helpers ----------------------------------------------------------------

struct Harness {
    pipeline: ScanPipeline,
    repo: Arc<ResourceRepository>,
    watcher: Arc<MockWatcher>,
    auditor: Arc<OpenPolicyAuditor>,
}

async fn harness(batch_size: usize, roles: usize) -> Harness {
    let pool = db::create_pool("sqlite::memory:").await.unwrap();
    let repo = Arc::new(ResourceRepository::new(pool));
    repo.insert_account(&NewAccount {
        identifier: IDENTIFIER.to_string(),
        name: ACCOUNT.to_string(),
        account_type: "AWS".to_string(),
        active: true,
        third_party: false,
        notes: Some(ACCOUNT.to_string()),
    })
    .await
    .unwrap();

    let watcher = Arc::new(
        MockWatcher::new("iamrole")
            .with_batch_size(batch_size)
            .with_resources((0..roles).map(|n| open_role(IDENTIFIER, n)).collect()),
    );
    let auditor = Arc::new(OpenPolicyAuditor::new("iamrole"));

    let mut registry = Registry::new();
    registry
        .register_watcher(watcher.clone())
        .register_auditor(auditor.clone());

    let pipeline = ScanPipeline::new(
        repo.clone(),
        Arc::new(registry),
        Arc::new(AppMetrics::new().unwrap()),
        Duration::days(7),
    );

    Harness {
        pipeline,
        repo,
        watcher,
        auditor,
    }
}

async fn counts(repo: &ResourceRepository) -> (i64, i64, i64) {
    (
        repo.count_items().await.unwrap(),
        repo.count_revisions().await.unwrap(),
        repo.count_audits().await.unwrap(),
    )
}

fn scan_task() -> Task {
    Task::Scan {
        account: ACCOUNT.to_string(),
        technology: "iamrole".to_string(),
    }
}

// ---- Batched scan scenario --------------------------------------------------

#[tokio::test]
async fn eleven_roles_in_batches_of_three() {
    let h = harness(3, 11).await;

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(h.watcher.list_calls(), 1);
    assert_eq!(h.watcher.batch_calls(), 4);
    assert_eq!(report.created, 11);
    assert_eq!(counts(&h.repo).await, (11, 11, 11));
}

#[tokio::test]
async fn removed_roles_get_one_deletion_marker_each() {
    let h = harness(3, 11).await;
    h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    h.watcher.remove_resource("roleNumber9");
    h.watcher.remove_resource("roleNumber10");
    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.deleted, 2);
    assert_eq!(counts(&h.repo).await, (11, 13, 11));

    let items = h.repo.list_items(Some(ACCOUNT), Some("iamrole"), 100).await.unwrap();
    for item in items {
        let expect_active = item.name != "roleNumber9" && item.name != "roleNumber10";
        assert_eq!(item.active, Some(expect_active), "{}", item.name);

        let history = h.repo.item_revisions(item.id).await.unwrap();
        if expect_active {
            assert_eq!(history.len(), 1);
        } else {
            assert_eq!(history.len(), 2);
            assert!(history[0].active);
            assert!(history[1].is_deletion_marker());
        }
    }
}

#[tokio::test]
async fn listing_failure_does_not_blow_up() {
    let h = harness(3, 11).await;
    h.watcher.fail_listing(FetchSubject::account(), "ListRoles: AccessDenied");

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert!(report.listing_aborted);
    assert_eq!(h.watcher.batch_calls(), 0);
    assert_eq!(counts(&h.repo).await, (0, 0, 0));
    let recorded = h.repo.list_exceptions(10, Some(EVENT_FETCH_ERROR)).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].subject.as_deref(), Some("*"));
}

// ---- Properties -------------------------------------------------------------

#[tokio::test]
async fn unchanged_snapshot_is_idempotent() {
    let h = harness(4, 9).await;
    h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();
    let before = counts(&h.repo).await;

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.revisions_created(), 0);
    assert_eq!(counts(&h.repo).await, before);
}

#[tokio::test]
async fn only_changed_items_reach_the_auditor() {
    let h = harness(0, 10).await;
    h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();
    assert_eq!(h.auditor.audited_items(), 10);

    // Modify three roles: drop the open statement from their policy.
    let mut roles: Vec<_> = (0..10).map(|n| open_role(IDENTIFIER, n)).collect();
    for role in roles.iter_mut().take(3) {
        role.config["InlinePolicies"] = serde_json::json!({});
    }
    h.watcher.set_resources(roles);

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.modified, 3);
    assert_eq!(report.audited, 3);
    assert_eq!(h.auditor.audited_items(), 13);
    assert_eq!(report.findings_recorded, 0);
}

#[tokio::test]
async fn one_failing_resource_leaves_the_rest_of_its_batch() {
    let h = harness(5, 5).await;
    h.watcher.fail_resource("roleNumber2");

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.created, 4);
    assert_eq!(report.fetch_errors, vec!["universal/roleNumber2: failed to fetch roleNumber2"]);
    assert_eq!(h.repo.count_items().await.unwrap(), 4);
}

#[tokio::test]
async fn fetch_error_keeps_known_item_from_being_deleted() {
    let h = harness(5, 5).await;
    h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();
    h.watcher.fail_resource("roleNumber2");

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.deleted, 0);
    assert_eq!(h.repo.count_revisions().await.unwrap(), 5);
}

#[tokio::test]
async fn reappearing_role_gets_a_fresh_active_revision() {
    let h = harness(0, 3).await;
    h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();
    h.watcher.remove_resource("roleNumber1");
    h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    h.watcher.set_resources((0..3).map(|n| open_role(IDENTIFIER, n)).collect());
    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.modified, 1);
    // Re-created with an open policy, so the fresh revision gets its own finding.
    assert_eq!(report.findings_recorded, 1);
    assert_eq!(counts(&h.repo).await, (3, 5, 4));
}

#[tokio::test]
async fn orphan_is_healed_during_scan() {
    let h = harness(0, 2).await;
    let account = h.repo.account_by_name(ACCOUNT).await.unwrap().unwrap();
    let tech = h.repo.technology("iamrole").await.unwrap();
    let orphan = h
        .repo
        .insert_bare_item(account.id, tech.id, "us-west-2", "half-written")
        .await
        .unwrap();

    let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();

    assert_eq!(report.orphans_repaired, 1);
    let history = h.repo.item_revisions(orphan).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_deletion_marker());
}

#[tokio::test]
async fn watcher_crash_is_recorded_and_returned_through_execute() {
    let h = harness(3, 4).await;
    h.watcher.fail_calls("socket closed");

    let err = h.pipeline.execute(&scan_task()).await.unwrap_err();

    assert!(matches!(err, TaskError::Watch(_)));
    let recorded = h.repo.list_exceptions(10, Some(EVENT_WATCH_FAILURE)).await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].account.as_deref(), Some(ACCOUNT));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn batching_fetches_everything_exactly_once(roles in 0usize..40, batch in 1usize..8) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let (batch_calls, items, revisions, report_calls) = runtime.block_on(async {
            let h = harness(batch, roles).await;
            let report = h.pipeline.scan_task(ACCOUNT, "iamrole").await.unwrap();
            (
                h.watcher.batch_calls(),
                h.repo.count_items().await.unwrap(),
                h.repo.count_revisions().await.unwrap(),
                report.fetch_calls,
            )
        });

        let expected_batches = (roles + batch - 1) / batch;
        prop_assert_eq!(batch_calls, expected_batches);
        prop_assert_eq!(report_calls, expected_batches + 1);
        prop_assert_eq!(items, roles as i64);
        prop_assert_eq!(revisions, roles as i64);
    }
}
