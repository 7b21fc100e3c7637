//! Audit trigger: runs the registered auditors over a set of targets and
//! attaches their findings to the revision each target was pinned to.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::adapters::{AuditTarget, Auditor, Finding, ScanContext};
use crate::pipeline::error::TaskError;
use crate::repository::ResourceRepository;

/// What one trigger run produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditOutcome {
    pub audited: usize,
    pub findings_recorded: u64,
}

pub struct AuditTrigger<'a> {
    repo: &'a ResourceRepository,
    auditors: &'a [Arc<dyn Auditor>],
}

impl<'a> AuditTrigger<'a> {
    pub fn new(repo: &'a ResourceRepository, auditors: &'a [Arc<dyn Auditor>]) -> Self {
        Self { repo, auditors }
    }

    /// Audit `targets`. An empty target list is a no-op and invokes nothing.
    pub async fn run(
        &self,
        ctx: &ScanContext,
        targets: &[AuditTarget],
    ) -> Result<AuditOutcome, TaskError> {
        if targets.is_empty() || self.auditors.is_empty() {
            return Ok(AuditOutcome::default());
        }

        let revisions: HashMap<i64, i64> = targets
            .iter()
            .map(|target| (target.item_id, target.revision_id))
            .collect();

        let mut pinned: Vec<(i64, Finding)> = Vec::new();
        for auditor in self.auditors {
            let findings = auditor.audit(ctx, targets).await?;
            for finding in findings {
                match revisions.get(&finding.item_id) {
                    Some(revision_id) => pinned.push((*revision_id, finding)),
                    None => tracing::warn!(
                        "{}: auditor {} reported item {} outside its input, discarding",
                        ctx,
                        auditor.index(),
                        finding.item_id
                    ),
                }
            }
        }

        let findings_recorded = self.repo.record_findings(&pinned, Utc::now()).await?;
        tracing::debug!(
            "{}: audited {} items, {} findings recorded",
            ctx,
            targets.len(),
            findings_recorded
        );

        Ok(AuditOutcome {
            audited: targets.len(),
            findings_recorded,
        })
    }
}
