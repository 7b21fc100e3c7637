//! Persisted row types for the resource store.
//!
//! These mirror the tables in `migrations/` one-to-one. Watcher output
//! (`ChangeItem`) lives in [`crate::adapters`] and is never stored as-is;
//! only the [`ItemRevision`] derived from it is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A monitored cloud account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub identifier: String,
    pub name: String,
    pub account_type: String,
    pub active: bool,
    pub third_party: bool,
    pub notes: Option<String>,
}

impl Account {
    /// Whether the scheduler should fan work out to this account.
    pub fn is_schedulable(&self) -> bool {
        self.active && !self.third_party
    }
}

/// Input for [`crate::repository::ResourceRepository::insert_account`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub identifier: String,
    pub name: String,
    pub account_type: String,
    pub active: bool,
    pub third_party: bool,
    pub notes: Option<String>,
}

/// A resource type ("technology"), e.g. `iamrole`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technology {
    pub id: i64,
    pub name: String,
}

/// Stable identity of one concrete resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub account_id: i64,
    pub tech_id: i64,
    pub region: String,
    pub name: String,
    pub arn: Option<String>,
    pub latest_revision_id: Option<i64>,
}

/// Immutable snapshot of an item's configuration at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRevision {
    pub id: i64,
    pub item_id: i64,
    pub active: bool,
    pub config: Value,
    pub date_created: DateTime<Utc>,
}

impl ItemRevision {
    /// `{}` and inactive: a deletion marker or a reconciled orphan.
    pub fn is_deletion_marker(&self) -> bool {
        !self.active && self.config == empty_config()
    }
}

/// A finding attached to the revision that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAudit {
    pub id: i64,
    pub item_id: i64,
    pub revision_id: i64,
    pub score: i64,
    pub issue: String,
    pub rule_id: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the diagnostic exception log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: i64,
    pub event_type: String,
    pub account: Option<String>,
    pub technology: Option<String>,
    pub subject: Option<String>,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

/// The configuration stored on deletion markers and reconciled orphans.
pub fn empty_config() -> Value {
    Value::Object(serde_json::Map::new())
}
