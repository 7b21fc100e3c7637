//! Watcher adapter interface
//!
//! A watcher turns one account's view of one resource type into a list of
//! [`ChangeItem`]s. Large inventories are fetched in batches: the pipeline
//! calls [`Watcher::slurp_list`] once, then [`Watcher::slurp_batch`] for each
//! chunk of [`Watcher::batch_size`] subjects.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::adapters::error::WatchError;
use crate::model::{Account, Technology};

/// Immutable per-invocation context passed to every adapter call.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub account: Account,
    pub technology: Technology,
}

impl ScanContext {
    pub fn new(account: Account, technology: Technology) -> Self {
        Self { account, technology }
    }
}

impl fmt::Display for ScanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account.name, self.technology.name)
    }
}

/// Identity of an item within one (account, technology) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub region: String,
    pub identity: String,
}

/// One freshly observed resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeItem {
    pub name: String,
    pub region: String,
    pub arn: Option<String>,
    pub config: Value,
}

impl ChangeItem {
    pub fn new(name: impl Into<String>, region: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            arn: None,
            config,
        }
    }

    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.arn = Some(arn.into());
        self
    }

    /// The ARN when the watcher reports one, otherwise the name.
    pub fn identity(&self) -> &str {
        self.arn.as_deref().unwrap_or(&self.name)
    }

    pub fn key(&self) -> ItemKey {
        ItemKey {
            region: self.region.clone(),
            identity: self.identity().to_string(),
        }
    }
}

/// What a fetch error is about. `None` fields widen the scope: an error with
/// no region and no name covers the whole account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FetchSubject {
    pub region: Option<String>,
    pub name: Option<String>,
}

impl FetchSubject {
    pub fn resource(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            name: Some(name.into()),
        }
    }

    pub fn region(region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            name: None,
        }
    }

    pub fn account() -> Self {
        Self::default()
    }

    /// Whether an item at `region`/`name` falls under this subject.
    pub fn covers(&self, region: &str, name: &str) -> bool {
        self.region.as_deref().map_or(true, |r| r == region)
            && self.name.as_deref().map_or(true, |n| n == name)
    }
}

impl fmt::Display for FetchSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.region, &self.name) {
            (Some(region), Some(name)) => write!(f, "{}/{}", region, name),
            (Some(region), None) => write!(f, "{}/*", region),
            (None, Some(name)) => write!(f, "*/{}", name),
            (None, None) => write!(f, "*"),
        }
    }
}

/// Per-resource failures collected during a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchErrors(BTreeMap<FetchSubject, String>);

impl FetchErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subject: FetchSubject, error: impl Into<String>) {
        self.0.insert(subject, error.into());
    }

    pub fn extend(&mut self, other: FetchErrors) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FetchSubject, &String)> {
        self.0.iter()
    }

    pub fn covers(&self, region: &str, name: &str) -> bool {
        self.0.keys().any(|subject| subject.covers(region, name))
    }
}

/// Result of a fetch call: whatever could be read, plus what could not.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub items: Vec<ChangeItem>,
    pub errors: FetchErrors,
}

/// Result of [`Watcher::slurp_list`]: opaque subjects to fetch in batches.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub subjects: Vec<String>,
    pub errors: FetchErrors,
}

/// Trait implemented once per resource type.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Technology name this watcher reports, e.g. `iamrole`.
    fn index(&self) -> &str;

    /// Subjects per [`Watcher::slurp_batch`] call. `0` means unbatched.
    fn batch_size(&self) -> usize {
        0
    }

    /// Scan cadence override; `None` uses the scheduler default.
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Fetch the whole snapshot in one call.
    async fn slurp(&self, ctx: &ScanContext) -> Result<Snapshot, WatchError>;

    /// List every subject that batched fetching will cover.
    async fn slurp_list(&self, _ctx: &ScanContext) -> Result<Listing, WatchError> {
        Err(WatchError::BatchingUnsupported {
            watcher: self.index().to_string(),
        })
    }

    /// Fetch full configuration for one batch of listed subjects.
    async fn slurp_batch(
        &self,
        _ctx: &ScanContext,
        _subjects: &[String],
    ) -> Result<Snapshot, WatchError> {
        Err(WatchError::BatchingUnsupported {
            watcher: self.index().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_prefers_arn_over_name() {
        let item = ChangeItem::new("roleNumber1", "universal", json!({}));
        assert_eq!(item.identity(), "roleNumber1");

        let item = item.with_arn("arn:aws:iam::012345678910:role/roleNumber1");
        assert_eq!(item.identity(), "arn:aws:iam::012345678910:role/roleNumber1");
        assert_eq!(item.key().region, "universal");
    }

    #[test]
    fn subject_scope_widens_with_missing_fields() {
        let exact = FetchSubject::resource("us-east-1", "bucket-a");
        assert!(exact.covers("us-east-1", "bucket-a"));
        assert!(!exact.covers("us-east-1", "bucket-b"));

        let region = FetchSubject::region("us-east-1");
        assert!(region.covers("us-east-1", "anything"));
        assert!(!region.covers("eu-west-1", "anything"));

        assert!(FetchSubject::account().covers("eu-west-1", "anything"));
    }

    #[test]
    fn fetch_errors_cover_any_matching_subject() {
        let mut errors = FetchErrors::new();
        errors.insert(FetchSubject::resource("universal", "roleNumber3"), "AccessDenied");

        assert!(errors.covers("universal", "roleNumber3"));
        assert!(!errors.covers("universal", "roleNumber4"));
        assert_eq!(errors.len(), 1);
    }
}
