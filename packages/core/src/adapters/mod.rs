//! Adapter contracts for resource-type specific collaborators.
//!
//! Watchers fetch snapshots, auditors evaluate rules. Neither knows about
//! the resource store: the pipeline hands them a [`ScanContext`] and
//! persists whatever they return.

pub mod auditor;
pub mod error;
pub mod mock;
pub mod registry;
pub mod watcher;

pub use auditor::{AuditTarget, Auditor, Finding};
pub use error::{AuditError, WatchError};
pub use registry::{Capability, Registry};
pub use watcher::{ChangeItem, FetchErrors, FetchSubject, ItemKey, Listing, ScanContext, Snapshot, Watcher};
