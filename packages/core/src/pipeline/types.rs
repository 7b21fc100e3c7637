//! Result types produced by pipeline tasks

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::{AuditTarget, ChangeItem, ScanContext};
use crate::model::empty_config;
use crate::repository::RevisionIds;

/// Why an item received a new revision in this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        }
    }
}

/// One member of the delta: an item and the revision this run created.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangedItem {
    pub kind: ChangeKind,
    pub item_id: i64,
    pub revision_id: i64,
    pub name: String,
    pub region: String,
    pub active: bool,
    pub config: Value,
}

impl ChangedItem {
    pub fn observed(kind: ChangeKind, ids: RevisionIds, item: &ChangeItem) -> Self {
        Self {
            kind,
            item_id: ids.item_id,
            revision_id: ids.revision_id,
            name: item.name.clone(),
            region: item.region.clone(),
            active: true,
            config: item.config.clone(),
        }
    }

    pub fn deleted(ids: RevisionIds, name: &str, region: &str) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            item_id: ids.item_id,
            revision_id: ids.revision_id,
            name: name.to_string(),
            region: region.to_string(),
            active: false,
            config: empty_config(),
        }
    }

    pub fn audit_target(&self) -> AuditTarget {
        AuditTarget {
            item_id: self.item_id,
            revision_id: self.revision_id,
            name: self.name.clone(),
            region: self.region.clone(),
            active: self.active,
            config: self.config.clone(),
        }
    }
}

/// Summary of one scan task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub account: String,
    pub technology: String,
    pub fetch_calls: usize,
    pub observed: usize,
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub orphans_repaired: usize,
    pub audited: usize,
    pub findings_recorded: u64,
    /// Rendered `subject: error` lines for every fetch error of the run.
    pub fetch_errors: Vec<String>,
    /// Listing reported errors, so fetching and deletion detection were skipped.
    pub listing_aborted: bool,
}

impl ScanReport {
    pub fn new(ctx: &ScanContext) -> Self {
        Self {
            account: ctx.account.name.clone(),
            technology: ctx.technology.name.clone(),
            ..Self::default()
        }
    }

    pub fn count(&mut self, changes: &[ChangedItem]) {
        for change in changes {
            match change.kind {
                ChangeKind::Created => self.created += 1,
                ChangeKind::Modified => self.modified += 1,
                ChangeKind::Deleted => self.deleted += 1,
            }
        }
    }

    pub fn revisions_created(&self) -> usize {
        self.created + self.modified + self.deleted + self.orphans_repaired
    }
}

/// Summary of one audit task (catch-up path).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub account: String,
    pub technology: String,
    pub audited: usize,
    pub findings_recorded: u64,
}

/// A task of a manual run that failed; the others still ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub account: String,
    pub technology: String,
    pub error: String,
}

/// Outcome of [`crate::pipeline::ScanPipeline::run_scan`] or `run_audit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary<T> {
    pub completed: Vec<T>,
    pub failed: Vec<TaskFailure>,
}

impl<T> Default for RunSummary<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> RunSummary<T> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}
