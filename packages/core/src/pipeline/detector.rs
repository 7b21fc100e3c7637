//! Change detection: snapshot in, append-only revisions out.
//!
//! A detector lives for exactly one scan task. It remembers every key it has
//! seen so the end-of-run deletion pass can diff the stored inventory against
//! the whole snapshot, and so a key repeated within the run never gets a
//! second revision.

use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::adapters::{ChangeItem, FetchErrors, ItemKey, ScanContext};
use crate::model::{empty_config, ItemRevision};
use crate::pipeline::types::{ChangeKind, ChangedItem};
use crate::repository::{ResourceRepository, RevisionIds, StoredItem};

pub struct ChangeDetector<'a> {
    repo: &'a ResourceRepository,
    ctx: &'a ScanContext,
    known: HashMap<ItemKey, i64>,
    seen: HashSet<ItemKey>,
}

impl<'a> ChangeDetector<'a> {
    /// Load the stored inventory for the context's (account, technology).
    pub async fn load(repo: &'a ResourceRepository, ctx: &'a ScanContext) -> Result<Self, sqlx::Error> {
        let known = repo
            .stored_items(ctx.account.id, ctx.technology.id)
            .await?
            .into_iter()
            .map(|item| (item.key(), item.id))
            .collect();

        Ok(Self {
            repo,
            ctx,
            known,
            seen: HashSet::new(),
        })
    }

    /// Number of distinct items observed so far in this run.
    pub fn observed(&self) -> usize {
        self.seen.len()
    }

    /// Compare one fetched batch against stored history and write a revision
    /// for every created or modified item. Returns the batch's delta.
    pub async fn find_changes_batch(
        &mut self,
        items: &[ChangeItem],
    ) -> Result<Vec<ChangedItem>, sqlx::Error> {
        let mut fresh = Vec::with_capacity(items.len());
        for item in items {
            if self.seen.insert(item.key()) {
                fresh.push(item);
            } else {
                tracing::warn!(
                    "{}: {} reported twice in one run, keeping the first copy",
                    self.ctx,
                    item.identity()
                );
            }
        }

        let known_ids: Vec<i64> = fresh
            .iter()
            .filter_map(|item| self.known.get(&item.key()).copied())
            .collect();
        let latest = self.repo.latest_revisions(&known_ids).await?;

        let mut changes = Vec::new();
        for item in fresh {
            let key = item.key();
            let change = match self.known.get(&key).copied() {
                Some(item_id) => self.update_if_changed(item_id, latest.get(&item_id), item).await?,
                None => self.create(item).await?,
            };
            if let Some(change) = change {
                self.known.insert(key, change.item_id);
                changes.push(change);
            }
        }

        Ok(changes)
    }

    /// Mark every stored, currently active item that this run did not see as
    /// deleted. Items covered by one of `errors` are left alone: failing to
    /// fetch a resource is not evidence that it is gone.
    pub async fn find_deleted(&mut self, errors: &FetchErrors) -> Result<Vec<ChangedItem>, sqlx::Error> {
        let stored = self
            .repo
            .stored_items(self.ctx.account.id, self.ctx.technology.id)
            .await?;

        let now = Utc::now();
        let mut changes = Vec::new();

        for item in stored.iter().filter(|item| self.is_missing(item)) {
            if errors.covers(&item.region, &item.name) {
                tracing::debug!(
                    "{}: {} missing but covered by a fetch error, not marking deleted",
                    self.ctx,
                    item.identity
                );
                continue;
            }

            let revision_id = self
                .repo
                .append_revision(item.id, &empty_config(), false, now)
                .await?;
            changes.push(ChangedItem::deleted(
                RevisionIds {
                    item_id: item.id,
                    revision_id,
                },
                &item.name,
                &item.region,
            ));
        }

        if !changes.is_empty() {
            tracing::info!("{}: {} items marked deleted", self.ctx, changes.len());
        }
        Ok(changes)
    }

    fn is_missing(&self, item: &StoredItem) -> bool {
        item.latest_active == Some(true) && !self.seen.contains(&item.key())
    }

    async fn create(&self, item: &ChangeItem) -> Result<Option<ChangedItem>, sqlx::Error> {
        let created = self
            .repo
            .create_item_with_revision(self.ctx.account.id, self.ctx.technology.id, item, Utc::now())
            .await?;

        if let Some(ids) = created {
            return Ok(Some(ChangedItem::observed(ChangeKind::Created, ids, item)));
        }

        // Another task created this identity after our inventory was loaded.
        let stored = self
            .repo
            .find_item(self.ctx.account.id, self.ctx.technology.id, &item.key())
            .await?
            .ok_or(sqlx::Error::RowNotFound)?;
        let mut latest = self.repo.latest_revisions(&[stored.id]).await?;
        self.update_if_changed(stored.id, latest.remove(&stored.id).as_ref(), item)
            .await
    }

    async fn update_if_changed(
        &self,
        item_id: i64,
        current: Option<&ItemRevision>,
        item: &ChangeItem,
    ) -> Result<Option<ChangedItem>, sqlx::Error> {
        if let Some(current) = current {
            if current.active && current.config == item.config {
                return Ok(None);
            }
        }

        let revision_id = self
            .repo
            .append_revision(item_id, &item.config, true, Utc::now())
            .await?;

        Ok(Some(ChangedItem::observed(
            ChangeKind::Modified,
            RevisionIds { item_id, revision_id },
            item,
        )))
    }
}
