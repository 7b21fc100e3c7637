//! In-memory adapters for tests and local dry runs.
//!
//! [`MockWatcher`] serves a mutable set of resources and counts every call,
//! so batching and failure behaviour can be asserted from the outside.
//! [`OpenPolicyAuditor`] fires one finding per item carrying an
//! allow-everything inline policy.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapters::{
    auditor::{AuditTarget, Auditor, Finding},
    error::{AuditError, WatchError},
    watcher::{ChangeItem, FetchErrors, FetchSubject, Listing, ScanContext, Snapshot, Watcher},
};

pub const OPEN_POLICY_RULE: &str = "iam-open-policy";

/// Build an IAM-role-shaped resource with an allow-everything inline policy.
pub fn open_role(account_identifier: &str, number: usize) -> ChangeItem {
    let name = format!("roleNumber{}", number);
    let arn = format!("arn:aws:iam::{}:role/{}", account_identifier, name);
    let config = json!({
        "RoleName": name,
        "RoleId": name,
        "Arn": arn,
        "InlinePolicies": {
            "ThePolicy": {
                "Statement": [
                    { "Effect": "Allow", "Action": "*", "Resource": "*" }
                ]
            }
        }
    });
    ChangeItem::new(name, "universal", config).with_arn(arn)
}

#[derive(Default)]
struct MockState {
    resources: BTreeMap<String, ChangeItem>,
    failing: BTreeSet<String>,
    listing_error: Option<(FetchSubject, String)>,
    call_error: Option<String>,
}

/// Configurable watcher backed by an in-memory resource map.
pub struct MockWatcher {
    index: String,
    batch_size: usize,
    state: Mutex<MockState>,
    slurp_calls: AtomicUsize,
    list_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

impl MockWatcher {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            batch_size: 0,
            state: Mutex::new(MockState::default()),
            slurp_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_resources(self, items: Vec<ChangeItem>) -> Self {
        self.set_resources(items);
        self
    }

    /// Replace the served resources.
    pub fn set_resources(&self, items: Vec<ChangeItem>) {
        let mut state = self.lock();
        state.resources = items
            .into_iter()
            .map(|item| (item.name.clone(), item))
            .collect();
    }

    pub fn remove_resource(&self, name: &str) {
        self.lock().resources.remove(name);
    }

    /// Make fetching `name` report a per-resource error.
    pub fn fail_resource(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    /// Make listing (and unbatched slurps) report `error` for `subject`.
    pub fn fail_listing(&self, subject: FetchSubject, error: &str) {
        self.lock().listing_error = Some((subject, error.to_string()));
    }

    /// Make every call fail outright.
    pub fn fail_calls(&self, message: &str) {
        self.lock().call_error = Some(message.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing.clear();
        state.listing_error = None;
        state.call_error = None;
    }

    pub fn slurp_calls(&self) -> usize {
        self.slurp_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_call(&self) -> Result<(), WatchError> {
        match &self.lock().call_error {
            Some(message) => Err(WatchError::network(message.clone())),
            None => Ok(()),
        }
    }

    fn fetch_named<'a>(&self, names: impl Iterator<Item = &'a String>) -> Snapshot {
        let state = self.lock();
        let mut snapshot = Snapshot::default();
        for name in names {
            let Some(item) = state.resources.get(name) else {
                continue;
            };
            if state.failing.contains(name) {
                snapshot.errors.insert(
                    FetchSubject::resource(&item.region, &item.name),
                    format!("failed to fetch {}", name),
                );
            } else {
                snapshot.items.push(item.clone());
            }
        }
        snapshot
    }
}

#[async_trait]
impl Watcher for MockWatcher {
    fn index(&self) -> &str {
        &self.index
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn slurp(&self, _ctx: &ScanContext) -> Result<Snapshot, WatchError> {
        self.slurp_calls.fetch_add(1, Ordering::SeqCst);
        self.check_call()?;

        let names: Vec<String> = self.lock().resources.keys().cloned().collect();
        let mut snapshot = self.fetch_named(names.iter());
        if let Some((subject, error)) = self.lock().listing_error.clone() {
            snapshot.errors.insert(subject, error);
        }
        Ok(snapshot)
    }

    async fn slurp_list(&self, _ctx: &ScanContext) -> Result<Listing, WatchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_call()?;

        let state = self.lock();
        let mut errors = FetchErrors::new();
        if let Some((subject, error)) = &state.listing_error {
            errors.insert(subject.clone(), error.clone());
        }
        Ok(Listing {
            subjects: state.resources.keys().cloned().collect(),
            errors,
        })
    }

    async fn slurp_batch(
        &self,
        _ctx: &ScanContext,
        subjects: &[String],
    ) -> Result<Snapshot, WatchError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_call()?;
        Ok(self.fetch_named(subjects.iter()))
    }
}

/// Flags inline policy statements that allow every action on every resource.
pub struct OpenPolicyAuditor {
    index: String,
    calls: AtomicUsize,
    audited: AtomicUsize,
    fail: Mutex<Option<String>>,
}

impl OpenPolicyAuditor {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            calls: AtomicUsize::new(0),
            audited: AtomicUsize::new(0),
            fail: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap_or_else(|p| p.into_inner()) = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Number of `audit` invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total targets received across all invocations.
    pub fn audited_items(&self) -> usize {
        self.audited.load(Ordering::SeqCst)
    }
}

fn has_open_statement(config: &Value) -> bool {
    let Some(policies) = config.get("InlinePolicies").and_then(Value::as_object) else {
        return false;
    };
    policies
        .values()
        .filter_map(|policy| policy.get("Statement").and_then(Value::as_array))
        .flatten()
        .any(|statement| {
            statement.get("Effect") == Some(&json!("Allow"))
                && statement.get("Action") == Some(&json!("*"))
                && statement.get("Resource") == Some(&json!("*"))
        })
}

#[async_trait]
impl Auditor for OpenPolicyAuditor {
    fn index(&self) -> &str {
        &self.index
    }

    async fn audit(
        &self,
        _ctx: &ScanContext,
        targets: &[AuditTarget],
    ) -> Result<Vec<Finding>, AuditError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.audited.fetch_add(targets.len(), Ordering::SeqCst);

        if let Some(message) = self.fail.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(AuditError::Rule {
                rule_id: OPEN_POLICY_RULE.to_string(),
                message,
            });
        }

        Ok(targets
            .iter()
            .filter(|target| target.active && has_open_statement(&target.config))
            .map(|target| Finding {
                item_id: target.item_id,
                score: 10,
                issue: "Unrestricted inline policy".to_string(),
                rule_id: OPEN_POLICY_RULE.to_string(),
                notes: Some(target.name.clone()),
            })
            .collect())
    }
}
