//! Auditor adapter interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapters::{error::AuditError, watcher::ScanContext};

/// An item handed to an auditor, pinned to the revision being evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTarget {
    pub item_id: i64,
    pub revision_id: i64,
    pub name: String,
    pub region: String,
    pub active: bool,
    pub config: Value,
}

/// One rule firing against one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub item_id: i64,
    pub score: i64,
    pub issue: String,
    pub rule_id: String,
    pub notes: Option<String>,
}

/// Trait implemented once per audited resource type.
#[async_trait]
pub trait Auditor: Send + Sync {
    /// Technology name whose items this auditor evaluates.
    fn index(&self) -> &str;

    /// Evaluate rules over `targets`. Findings must reference a target's
    /// `item_id`; anything else is discarded by the caller.
    async fn audit(
        &self,
        ctx: &ScanContext,
        targets: &[AuditTarget],
    ) -> Result<Vec<Finding>, AuditError>;
}
