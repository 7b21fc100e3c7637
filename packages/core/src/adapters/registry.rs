//! Registration table of watchers and auditors, keyed by technology.
//!
//! Built once at startup and shared by `Arc`. The scheduler derives its work
//! matrix from it and the pipeline resolves adapters through it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{auditor::Auditor, watcher::Watcher};

/// Everything registered for one technology.
#[derive(Clone, Default)]
pub struct Capability {
    pub watcher: Option<Arc<dyn Watcher>>,
    pub auditors: Vec<Arc<dyn Auditor>>,
}

#[derive(Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, Capability>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `watcher` under its index, replacing any previous watcher.
    pub fn register_watcher(&mut self, watcher: Arc<dyn Watcher>) -> &mut Self {
        let key = watcher.index().to_string();
        self.entries.entry(key).or_default().watcher = Some(watcher);
        self
    }

    pub fn register_auditor(&mut self, auditor: Arc<dyn Auditor>) -> &mut Self {
        let key = auditor.index().to_string();
        self.entries.entry(key).or_default().auditors.push(auditor);
        self
    }

    /// Technologies with a watcher, in name order.
    pub fn technologies(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, cap)| cap.watcher.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Technologies with at least one auditor, in name order.
    pub fn audit_categories(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(_, cap)| !cap.auditors.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn watcher(&self, technology: &str) -> Option<Arc<dyn Watcher>> {
        self.entries.get(technology)?.watcher.clone()
    }

    pub fn auditors(&self, technology: &str) -> &[Arc<dyn Auditor>] {
        self.entries
            .get(technology)
            .map(|cap| cap.auditors.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::mock::{MockWatcher, OpenPolicyAuditor};

    #[test]
    fn technologies_and_audit_categories_are_tracked_separately() {
        let mut registry = Registry::new();
        registry
            .register_watcher(Arc::new(MockWatcher::new("iamrole")))
            .register_watcher(Arc::new(MockWatcher::new("s3")))
            .register_auditor(Arc::new(OpenPolicyAuditor::new("iamrole")));

        assert_eq!(registry.technologies(), vec!["iamrole", "s3"]);
        assert_eq!(registry.audit_categories(), vec!["iamrole"]);
        assert_eq!(registry.auditors("iamrole").len(), 1);
        assert!(registry.auditors("s3").is_empty());
        assert!(registry.watcher("sqs").is_none());
    }

    #[test]
    fn re_registering_a_watcher_replaces_it() {
        let mut registry = Registry::new();
        registry.register_watcher(Arc::new(MockWatcher::new("iamrole")));
        registry.register_watcher(Arc::new(MockWatcher::new("iamrole").with_batch_size(3)));

        assert_eq!(registry.technologies().len(), 1);
        assert_eq!(registry.watcher("iamrole").unwrap().batch_size(), 3);
    }
}
