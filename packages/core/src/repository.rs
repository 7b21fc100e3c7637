//! Database repository for accounts, items, revisions and findings.
//!
//! All SQLite read/write logic lives here. Revisions are append-only: the
//! only UPDATE this module ever issues against `items` moves the
//! `latest_revision_id` pointer, and it does so in the same transaction that
//! inserted the revision it points at.
//!
//! Item creation relies on the `UNIQUE (account_id, tech_id, region,
//! identity)` constraint. [`ResourceRepository::create_item_with_revision`]
//! returns `None` when another writer got there first, and callers fall back
//! to the update path.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::adapters::{AuditTarget, ChangeItem, Finding, ItemKey};
use crate::model::{Account, ExceptionRecord, Item, ItemAudit, ItemRevision, NewAccount, Technology};

/// SQLite caps bound parameters per statement; stay well below it.
const IN_CLAUSE_CHUNK: usize = 500;

/// Upper bound for list endpoints.
pub const MAX_LIST_LIMIT: i64 = 500;

/// An item as seen by the change detector: identity plus latest state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredItem {
    pub id: i64,
    pub region: String,
    pub name: String,
    pub identity: String,
    pub latest_revision_id: Option<i64>,
    pub latest_active: Option<bool>,
}

impl StoredItem {
    pub fn key(&self) -> ItemKey {
        ItemKey {
            region: self.region.clone(),
            identity: self.identity.clone(),
        }
    }
}

/// Ids produced by a revision write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionIds {
    pub item_id: i64,
    pub revision_id: i64,
}

/// Flattened item row for reporting consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSummary {
    pub id: i64,
    pub account: String,
    pub technology: String,
    pub region: String,
    pub name: String,
    pub arn: Option<String>,
    pub latest_revision_id: Option<i64>,
    pub active: Option<bool>,
    pub last_changed: Option<String>,
}

/// Repository over the resource store tables.
pub struct ResourceRepository {
    pool: SqlitePool,
}

impl ResourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- Accounts ----

    /// Insert an account row. Returns the new row id.
    pub async fn insert_account(&self, account: &NewAccount) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO accounts (identifier, name, account_type, active, third_party, notes)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&account.identifier)
        .bind(&account.name)
        .bind(&account.account_type)
        .bind(account.active as i64)
        .bind(account.third_party as i64)
        .bind(&account.notes)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Accounts the scheduler fans out to: active and not third party.
    pub async fn schedulable_accounts(&self) -> Result<Vec<Account>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, identifier, name, account_type, active, third_party, notes
             FROM accounts
             WHERE active = 1 AND third_party = 0
             ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_account).collect()
    }

    pub async fn account_by_name(&self, name: &str) -> Result<Option<Account>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, identifier, name, account_type, active, third_party, notes
             FROM accounts WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_account).transpose()
    }

    // ---- Technologies ----

    /// Look up a technology by name, creating it on first use.
    pub async fn technology(&self, name: &str) -> Result<Technology, sqlx::Error> {
        sqlx::query("INSERT INTO technologies (name) VALUES (?) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query("SELECT id, name FROM technologies WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        Ok(Technology {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
        })
    }

    // ---- Items and revisions (write side) ----

    /// Insert an item with no revision. Normal scans never do this; it exists
    /// for imports and for exercising the orphan reconciler.
    pub async fn insert_bare_item(
        &self,
        account_id: i64,
        tech_id: i64,
        region: &str,
        name: &str,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO items (account_id, tech_id, region, name, identity) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(tech_id)
        .bind(region)
        .bind(name)
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Create an item and its first (active) revision in one transaction.
    ///
    /// Returns `None` if an item with the same identity already exists.
    pub async fn create_item_with_revision(
        &self,
        account_id: i64,
        tech_id: i64,
        item: &ChangeItem,
        now: DateTime<Utc>,
    ) -> Result<Option<RevisionIds>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO items (account_id, tech_id, region, name, arn, identity)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (account_id, tech_id, region, identity) DO NOTHING
             RETURNING id",
        )
        .bind(account_id)
        .bind(tech_id)
        .bind(&item.region)
        .bind(&item.name)
        .bind(&item.arn)
        .bind(item.identity())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = inserted else {
            tx.rollback().await?;
            return Ok(None);
        };

        let item_id: i64 = row.try_get("id")?;
        let revision_id = insert_revision(&mut *tx, item_id, &item.config, true, now).await?;
        tx.commit().await?;

        Ok(Some(RevisionIds { item_id, revision_id }))
    }

    /// Append a revision to an existing item and move its latest pointer.
    pub async fn append_revision(
        &self,
        item_id: i64,
        config: &Value,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let revision_id = insert_revision(&mut *tx, item_id, config, active, now).await?;
        tx.commit().await?;
        Ok(revision_id)
    }

    // ---- Items and revisions (read side) ----

    /// Every item of an (account, technology) pair with its latest state.
    pub async fn stored_items(
        &self,
        account_id: i64,
        tech_id: i64,
    ) -> Result<Vec<StoredItem>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT i.id, i.region, i.name, i.identity, i.latest_revision_id, r.active AS latest_active
             FROM items i
             LEFT JOIN item_revisions r ON r.id = i.latest_revision_id
             WHERE i.account_id = ? AND i.tech_id = ?
             ORDER BY i.id ASC",
        )
        .bind(account_id)
        .bind(tech_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stored_item).collect()
    }

    pub async fn find_item(
        &self,
        account_id: i64,
        tech_id: i64,
        key: &ItemKey,
    ) -> Result<Option<StoredItem>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT i.id, i.region, i.name, i.identity, i.latest_revision_id, r.active AS latest_active
             FROM items i
             LEFT JOIN item_revisions r ON r.id = i.latest_revision_id
             WHERE i.account_id = ? AND i.tech_id = ? AND i.region = ? AND i.identity = ?",
        )
        .bind(account_id)
        .bind(tech_id)
        .bind(&key.region)
        .bind(&key.identity)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_stored_item).transpose()
    }

    pub async fn get_item(&self, item_id: i64) -> Result<Option<Item>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, account_id, tech_id, region, name, arn, latest_revision_id
             FROM items WHERE id = ?",
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Item, sqlx::Error> {
            Ok(Item {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                tech_id: row.try_get("tech_id")?,
                region: row.try_get("region")?,
                name: row.try_get("name")?,
                arn: row.try_get("arn")?,
                latest_revision_id: row.try_get("latest_revision_id")?,
            })
        })
        .transpose()
    }

    /// Latest revision for each of `item_ids`, keyed by item id. Items
    /// without a revision are absent from the map.
    pub async fn latest_revisions(
        &self,
        item_ids: &[i64],
    ) -> Result<HashMap<i64, ItemRevision>, sqlx::Error> {
        let mut latest = HashMap::with_capacity(item_ids.len());

        for chunk in item_ids.chunks(IN_CLAUSE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT r.id, r.item_id, r.active, r.config, r.date_created
                 FROM items i
                 JOIN item_revisions r ON r.id = i.latest_revision_id
                 WHERE i.id IN ({})",
                placeholders
            );

            let mut q = sqlx::query(&sql);
            for id in chunk {
                q = q.bind(id);
            }

            for row in q.fetch_all(&self.pool).await? {
                let revision = row_to_revision(&row)?;
                latest.insert(revision.item_id, revision);
            }
        }

        Ok(latest)
    }

    /// Items of an (account, technology) pair that have no latest revision.
    pub async fn orphaned_items(
        &self,
        account_id: i64,
        tech_id: i64,
    ) -> Result<Vec<StoredItem>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, region, name, identity, latest_revision_id, NULL AS latest_active
             FROM items
             WHERE account_id = ? AND tech_id = ? AND latest_revision_id IS NULL
             ORDER BY id ASC",
        )
        .bind(account_id)
        .bind(tech_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_stored_item).collect()
    }

    /// Full revision history of one item, oldest first.
    pub async fn item_revisions(&self, item_id: i64) -> Result<Vec<ItemRevision>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, item_id, active, config, date_created
             FROM item_revisions WHERE item_id = ? ORDER BY id ASC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_revision).collect()
    }

    /// Items for reporting, optionally filtered by account and technology
    /// name. `limit` is clamped to [`MAX_LIST_LIMIT`].
    pub async fn list_items(
        &self,
        account: Option<&str>,
        technology: Option<&str>,
        limit: i64,
    ) -> Result<Vec<ItemSummary>, sqlx::Error> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);

        let mut conditions = vec!["1=1"];
        if account.is_some() {
            conditions.push("a.name = ?");
        }
        if technology.is_some() {
            conditions.push("t.name = ?");
        }

        let sql = format!(
            "SELECT i.id, a.name AS account, t.name AS technology, i.region, i.name, i.arn,
                    i.latest_revision_id, r.active AS latest_active, r.date_created AS last_changed
             FROM items i
             JOIN accounts a ON a.id = i.account_id
             JOIN technologies t ON t.id = i.tech_id
             LEFT JOIN item_revisions r ON r.id = i.latest_revision_id
             WHERE {}
             ORDER BY i.id ASC
             LIMIT ?",
            conditions.join(" AND ")
        );

        let mut q = sqlx::query(&sql);
        if let Some(account) = account {
            q = q.bind(account);
        }
        if let Some(technology) = technology {
            q = q.bind(technology);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<ItemSummary, sqlx::Error> {
                let latest_active: Option<i64> = row.try_get("latest_active")?;
                Ok(ItemSummary {
                    id: row.try_get("id")?,
                    account: row.try_get("account")?,
                    technology: row.try_get("technology")?,
                    region: row.try_get("region")?,
                    name: row.try_get("name")?,
                    arn: row.try_get("arn")?,
                    latest_revision_id: row.try_get("latest_revision_id")?,
                    active: latest_active.map(|a| a != 0),
                    last_changed: row.try_get("last_changed")?,
                })
            })
            .collect()
    }

    // ---- Findings ----

    /// Latest revisions of an (account, technology) pair with no findings
    /// attached yet, shaped as audit input.
    pub async fn unaudited_targets(
        &self,
        account_id: i64,
        tech_id: i64,
    ) -> Result<Vec<AuditTarget>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT i.id AS item_id, i.name, i.region, r.id AS revision_id, r.active, r.config
             FROM items i
             JOIN item_revisions r ON r.id = i.latest_revision_id
             WHERE i.account_id = ? AND i.tech_id = ?
               AND NOT EXISTS (SELECT 1 FROM item_audits a WHERE a.revision_id = r.id)
             ORDER BY i.id ASC",
        )
        .bind(account_id)
        .bind(tech_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AuditTarget, sqlx::Error> {
                let active: i64 = row.try_get("active")?;
                let config: String = row.try_get("config")?;
                Ok(AuditTarget {
                    item_id: row.try_get("item_id")?,
                    revision_id: row.try_get("revision_id")?,
                    name: row.try_get("name")?,
                    region: row.try_get("region")?,
                    active: active != 0,
                    config: parse_config(&config)?,
                })
            })
            .collect()
    }

    /// Persist findings, each attached to the given revision. A finding that
    /// repeats `(revision, rule_id, issue)` is skipped. Returns rows inserted.
    pub async fn record_findings(
        &self,
        findings: &[(i64, Finding)],
        now: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        if findings.is_empty() {
            return Ok(0);
        }

        let created_at = now.to_rfc3339();
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;

        for (revision_id, finding) in findings {
            let result = sqlx::query(
                "INSERT INTO item_audits (item_id, revision_id, score, issue, rule_id, notes, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (revision_id, rule_id, issue) DO NOTHING",
            )
            .bind(finding.item_id)
            .bind(revision_id)
            .bind(finding.score)
            .bind(&finding.issue)
            .bind(&finding.rule_id)
            .bind(&finding.notes)
            .bind(&created_at)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// All findings ever attached to an item, oldest first.
    pub async fn item_audits(&self, item_id: i64) -> Result<Vec<ItemAudit>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, item_id, revision_id, score, issue, rule_id, notes, created_at
             FROM item_audits WHERE item_id = ? ORDER BY id ASC",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ItemAudit, sqlx::Error> {
                let created_at: String = row.try_get("created_at")?;
                Ok(ItemAudit {
                    id: row.try_get("id")?,
                    item_id: row.try_get("item_id")?,
                    revision_id: row.try_get("revision_id")?,
                    score: row.try_get("score")?,
                    issue: row.try_get("issue")?,
                    rule_id: row.try_get("rule_id")?,
                    notes: row.try_get("notes")?,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    // ---- Exceptions ----

    pub async fn insert_exception(
        &self,
        event_type: &str,
        account: Option<&str>,
        technology: Option<&str>,
        subject: Option<&str>,
        error: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO exceptions (event_type, account, technology, subject, error, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event_type)
        .bind(account)
        .bind(technology)
        .bind(subject)
        .bind(error)
        .bind(occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent exceptions first, optionally filtered by event type.
    pub async fn list_exceptions(
        &self,
        limit: i64,
        event_type: Option<&str>,
    ) -> Result<Vec<ExceptionRecord>, sqlx::Error> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let sql = match event_type {
            Some(_) => {
                "SELECT id, event_type, account, technology, subject, error, occurred_at
                 FROM exceptions WHERE event_type = ? ORDER BY id DESC LIMIT ?"
            }
            None => {
                "SELECT id, event_type, account, technology, subject, error, occurred_at
                 FROM exceptions ORDER BY id DESC LIMIT ?"
            }
        };

        let mut q = sqlx::query(sql);
        if let Some(event_type) = event_type {
            q = q.bind(event_type);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<ExceptionRecord, sqlx::Error> {
                let occurred_at: String = row.try_get("occurred_at")?;
                Ok(ExceptionRecord {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    account: row.try_get("account")?,
                    technology: row.try_get("technology")?,
                    subject: row.try_get("subject")?,
                    error: row.try_get("error")?,
                    occurred_at: parse_timestamp(&occurred_at)?,
                })
            })
            .collect()
    }

    /// Delete exceptions recorded before `cutoff`. Returns rows deleted.
    pub async fn delete_exceptions_before(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM exceptions WHERE occurred_at < ?")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    // ---- Counts ----

    pub async fn count_items(&self) -> Result<i64, sqlx::Error> {
        self.count("SELECT COUNT(*) AS cnt FROM items").await
    }

    pub async fn count_revisions(&self) -> Result<i64, sqlx::Error> {
        self.count("SELECT COUNT(*) AS cnt FROM item_revisions").await
    }

    pub async fn count_audits(&self) -> Result<i64, sqlx::Error> {
        self.count("SELECT COUNT(*) AS cnt FROM item_audits").await
    }

    pub async fn count_exceptions(&self) -> Result<i64, sqlx::Error> {
        self.count("SELECT COUNT(*) AS cnt FROM exceptions").await
    }

    async fn count(&self, sql: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(sql).fetch_one(&self.pool).await?;
        row.try_get("cnt")
    }
}

/// Insert a revision and point its item at it. Runs on the caller's
/// transaction so both writes land together.
async fn insert_revision(
    conn: &mut SqliteConnection,
    item_id: i64,
    config: &Value,
    active: bool,
    now: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let config = serde_json::to_string(config)
        .map_err(|e| sqlx::Error::Protocol(format!("could not encode configuration: {}", e)))?;

    let result = sqlx::query(
        "INSERT INTO item_revisions (item_id, active, config, date_created) VALUES (?, ?, ?, ?)",
    )
    .bind(item_id)
    .bind(active as i64)
    .bind(&config)
    .bind(now.to_rfc3339())
    .execute(&mut *conn)
    .await?;

    let revision_id = result.last_insert_rowid();

    sqlx::query("UPDATE items SET latest_revision_id = ? WHERE id = ?")
        .bind(revision_id)
        .bind(item_id)
        .execute(&mut *conn)
        .await?;

    Ok(revision_id)
}

fn parse_config(raw: &str) -> Result<Value, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn row_to_account(row: &SqliteRow) -> Result<Account, sqlx::Error> {
    let active: i64 = row.try_get("active")?;
    let third_party: i64 = row.try_get("third_party")?;
    Ok(Account {
        id: row.try_get("id")?,
        identifier: row.try_get("identifier")?,
        name: row.try_get("name")?,
        account_type: row.try_get("account_type")?,
        active: active != 0,
        third_party: third_party != 0,
        notes: row.try_get("notes")?,
    })
}

fn row_to_stored_item(row: &SqliteRow) -> Result<StoredItem, sqlx::Error> {
    let latest_active: Option<i64> = row.try_get("latest_active")?;
    Ok(StoredItem {
        id: row.try_get("id")?,
        region: row.try_get("region")?,
        name: row.try_get("name")?,
        identity: row.try_get("identity")?,
        latest_revision_id: row.try_get("latest_revision_id")?,
        latest_active: latest_active.map(|a| a != 0),
    })
}

fn row_to_revision(row: &SqliteRow) -> Result<ItemRevision, sqlx::Error> {
    let active: i64 = row.try_get("active")?;
    let config: String = row.try_get("config")?;
    let date_created: String = row.try_get("date_created")?;
    Ok(ItemRevision {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        active: active != 0,
        config: parse_config(&config)?,
        date_created: parse_timestamp(&date_created)?,
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use serde_json::json;

    fn role(name: &str, policy: &str) -> ChangeItem {
        ChangeItem::new(name, "universal", json!({ "RoleName": name, "Policy": policy }))
    }

    #[tokio::test]
    async fn schedulable_accounts_excludes_inactive_and_third_party() {
        let repo = make_repo().await;
        repo.insert_account(&new_account("TEST_ACCOUNT1", "012345678910", true, false)).await.unwrap();
        repo.insert_account(&new_account("TEST_ACCOUNT2", "123123123123", true, false)).await.unwrap();
        repo.insert_account(&new_account("TEST_ACCOUNT3", "109876543210", false, false)).await.unwrap();
        repo.insert_account(&new_account("PARTNER", "456456456456", true, true)).await.unwrap();

        let accounts = repo.schedulable_accounts().await.unwrap();
        let names: Vec<&str> = accounts.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["TEST_ACCOUNT1", "TEST_ACCOUNT2"]);
    }

    #[tokio::test]
    async fn technology_is_created_once() {
        let repo = make_repo().await;
        let first = repo.technology("iamrole").await.unwrap();
        let second = repo.technology("iamrole").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn create_item_sets_latest_revision() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;

        let ids = repo
            .create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now())
            .await
            .unwrap()
            .unwrap();

        let item = repo.get_item(ids.item_id).await.unwrap().unwrap();
        assert_eq!(item.latest_revision_id, Some(ids.revision_id));

        let revisions = repo.item_revisions(ids.item_id).await.unwrap();
        assert_eq!(revisions.len(), 1);
        assert!(revisions[0].active);
        assert_eq!(revisions[0].config["Policy"], "v1");
    }

    #[tokio::test]
    async fn nested_config_reads_back_unchanged() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let config = json!({
            "RoleName": "nested",
            "AssumeRolePolicyDocument": {
                "Statement": [{ "Effect": "Allow", "Principal": { "AWS": ["*"] } }],
                "Version": "2012-10-17"
            },
            "Tags": [],
            "Description": "rôle with \"quotes\" and unicode",
            "MaxSessionDuration": 3600,
            "PermissionsBoundary": null
        });
        let item = ChangeItem::new("nested", "universal", config.clone());

        let ids = repo
            .create_item_with_revision(account.id, tech.id, &item, Utc::now())
            .await
            .unwrap()
            .unwrap();
        repo.append_revision(ids.item_id, &json!({}), false, Utc::now())
            .await
            .unwrap();

        let revisions = repo.item_revisions(ids.item_id).await.unwrap();
        assert_eq!(revisions[0].config, config);
        assert_eq!(revisions[1].config, json!({}));
        assert!(revisions[1].is_deletion_marker());
    }

    #[tokio::test]
    async fn duplicate_identity_create_returns_none() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;

        let first = repo
            .create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now())
            .await
            .unwrap();
        let second = repo
            .create_item_with_revision(account.id, tech.id, &role("a", "v2"), Utc::now())
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(repo.count_items().await.unwrap(), 1);
        assert_eq!(repo.count_revisions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn append_revision_keeps_history_and_moves_pointer() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let ids = repo
            .create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now())
            .await
            .unwrap()
            .unwrap();

        let second = repo
            .append_revision(ids.item_id, &json!({}), false, Utc::now())
            .await
            .unwrap();

        let latest = repo.latest_revisions(&[ids.item_id]).await.unwrap();
        assert_eq!(latest[&ids.item_id].id, second);
        assert!(latest[&ids.item_id].is_deletion_marker());

        let history = repo.item_revisions(ids.item_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].config["Policy"], "v1");
    }

    #[tokio::test]
    async fn orphaned_items_only_lists_items_without_revisions() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        repo.create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now())
            .await
            .unwrap();
        let orphan_id = repo
            .insert_bare_item(account.id, tech.id, "us-east-1", "orphaned")
            .await
            .unwrap();

        let orphans = repo.orphaned_items(account.id, tech.id).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, orphan_id);
        assert!(orphans[0].latest_revision_id.is_none());
    }

    #[tokio::test]
    async fn latest_revisions_skips_items_without_revisions() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let orphan_id = repo
            .insert_bare_item(account.id, tech.id, "us-east-1", "orphaned")
            .await
            .unwrap();

        let latest = repo.latest_revisions(&[orphan_id]).await.unwrap();
        assert!(latest.is_empty());
    }

    #[tokio::test]
    async fn findings_are_unique_per_revision_rule_and_issue() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let ids = repo
            .create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now())
            .await
            .unwrap()
            .unwrap();

        let finding = Finding {
            item_id: ids.item_id,
            score: 10,
            issue: "Unrestricted inline policy".into(),
            rule_id: "iam-open-policy".into(),
            notes: None,
        };
        let batch = vec![(ids.revision_id, finding.clone()), (ids.revision_id, finding)];

        let inserted = repo.record_findings(&batch, Utc::now()).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(repo.item_audits(ids.item_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unaudited_targets_excludes_revisions_with_findings() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let audited = repo
            .create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        let pending = repo
            .create_item_with_revision(account.id, tech.id, &role("b", "v1"), Utc::now())
            .await
            .unwrap()
            .unwrap();
        let finding = Finding {
            item_id: audited.item_id,
            score: 1,
            issue: "x".into(),
            rule_id: "r".into(),
            notes: None,
        };
        repo.record_findings(&[(audited.revision_id, finding)], Utc::now()).await.unwrap();

        let targets = repo.unaudited_targets(account.id, tech.id).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].item_id, pending.item_id);
        assert_eq!(targets[0].revision_id, pending.revision_id);
    }

    #[tokio::test]
    async fn list_items_filters_by_account_and_technology() {
        let repo = make_repo().await;
        let (account, tech) = seed(&repo).await;
        let other_tech = repo.technology("s3").await.unwrap();
        repo.create_item_with_revision(account.id, tech.id, &role("a", "v1"), Utc::now()).await.unwrap();
        repo.create_item_with_revision(account.id, other_tech.id, &role("bucket", "v1"), Utc::now()).await.unwrap();

        let all = repo.list_items(Some("TEST_ACCOUNT1"), None, 50).await.unwrap();
        assert_eq!(all.len(), 2);

        let roles = repo.list_items(None, Some("iamrole"), 50).await.unwrap();
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, "a");
        assert_eq!(roles[0].active, Some(true));
    }

    #[tokio::test]
    async fn delete_exceptions_before_prunes_old_rows() {
        let repo = make_repo().await;
        let old = Utc::now() - chrono::Duration::days(10);
        repo.insert_exception("scheduler-exception-on-watch", None, None, None, "boom", old)
            .await
            .unwrap();
        repo.insert_exception("scheduler-exception-on-watch", None, None, None, "boom", Utc::now())
            .await
            .unwrap();

        let deleted = repo
            .delete_exceptions_before(Utc::now() - chrono::Duration::days(7))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(repo.count_exceptions().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_exceptions_filters_by_event_type() {
        let repo = make_repo().await;
        repo.insert_exception("scheduler-exception-on-watch", Some("A"), Some("iamrole"), None, "x", Utc::now())
            .await
            .unwrap();
        repo.insert_exception("scheduler-exception-on-audit", Some("A"), Some("iamrole"), None, "y", Utc::now())
            .await
            .unwrap();

        let audits = repo
            .list_exceptions(10, Some("scheduler-exception-on-audit"))
            .await
            .unwrap();
        assert_eq!(audits.len(), 1);
        assert_eq!(audits[0].error, "y");
        assert_eq!(repo.list_exceptions(10, None).await.unwrap().len(), 2);
    }
}
