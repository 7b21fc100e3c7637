//! Orphan repair.
//!
//! An orphan is an item row with no latest revision, left behind by a crash
//! between the two writes of an older, non-transactional creation path or by
//! a partial import. Each one gets a single inactive `{}` revision so every
//! item in the store ends up with a latest revision.

use chrono::Utc;

use crate::adapters::ScanContext;
use crate::model::empty_config;
use crate::repository::ResourceRepository;

/// Attach a deletion-marker revision to every orphan of `ctx`'s
/// (account, technology). Returns the ids of the repaired items.
pub async fn reconcile_orphans(
    repo: &ResourceRepository,
    ctx: &ScanContext,
) -> Result<Vec<i64>, sqlx::Error> {
    let orphans = repo
        .orphaned_items(ctx.account.id, ctx.technology.id)
        .await?;
    if orphans.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let mut repaired = Vec::with_capacity(orphans.len());
    for orphan in orphans {
        repo.append_revision(orphan.id, &empty_config(), false, now)
            .await?;
        tracing::debug!("{}: repaired orphan {} ({})", ctx, orphan.id, orphan.name);
        repaired.push(orphan.id);
    }

    tracing::info!("{}: {} orphaned items repaired", ctx, repaired.len());
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{make_repo, seed};

    #[tokio::test]
    async fn orphan_gets_one_inactive_empty_revision() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let ctx = ScanContext::new(account.clone(), tech.clone());
        let orphan = repo
            .insert_bare_item(account.id, tech.id, "us-east-1", "half-written")
            .await
            .unwrap();

        let repaired = reconcile_orphans(&repo, &ctx).await.unwrap();

        assert_eq!(repaired, vec![orphan]);
        let item = repo.get_item(orphan).await.unwrap().unwrap();
        assert!(item.latest_revision_id.is_some());
        let history = repo.item_revisions(orphan).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_deletion_marker());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let ctx = ScanContext::new(account.clone(), tech.clone());
        repo.insert_bare_item(account.id, tech.id, "us-east-1", "half-written")
            .await
            .unwrap();

        reconcile_orphans(&repo, &ctx).await.unwrap();
        let second = reconcile_orphans(&repo, &ctx).await.unwrap();

        assert!(second.is_empty());
        assert_eq!(repo.count_revisions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn other_technologies_are_left_alone() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let other = repo.technology("s3").await.unwrap();
        let ctx = ScanContext::new(account.clone(), tech);
        repo.insert_bare_item(account.id, other.id, "us-east-1", "bucket")
            .await
            .unwrap();

        assert!(reconcile_orphans(&repo, &ctx).await.unwrap().is_empty());
        assert_eq!(repo.orphaned_items(account.id, other.id).await.unwrap().len(), 1);
    }
}
