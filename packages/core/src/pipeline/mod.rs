//! Scan-and-audit pipeline
//!
//! One scan task walks a watcher's snapshot through change detection,
//! deletion detection, orphan reconciliation and the audit trigger, in that
//! order. Audit tasks run the catch-up path over revisions with no findings.

pub mod audit;
pub mod detector;
pub mod engine;
pub mod error;
pub mod reconciler;
pub mod types;

pub use engine::ScanPipeline;
pub use error::TaskError;
pub use types::*;
