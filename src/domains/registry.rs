//! Domain Registry
//!
//! Read-mostly map from domain name to plugin. Registration normally happens
//! once at start-up; the map carries its own lock so late registration never
//! touches session locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::info;

use super::{DomainError, DomainPlugin};

#[derive(Default)]
pub struct DomainRegistry {
    domains: RwLock<HashMap<String, Arc<dyn DomainPlugin>>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock only means a writer panicked mid-insert of a single
    // entry; the map itself is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn DomainPlugin>>> {
        self.domains.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<dyn DomainPlugin>>> {
        self.domains.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, plugin: Arc<dyn DomainPlugin>) -> Result<(), DomainError> {
        let name = plugin.name().to_string();
        let mut domains = self.write();
        if domains.contains_key(&name) {
            return Err(DomainError::AlreadyRegistered { domain: name });
        }
        info!(domain = %name, verbs = plugin.vocabulary().verbs.len(), "registered domain");
        domains.insert(name, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DomainPlugin>> {
        self.read().get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn DomainPlugin>, DomainError> {
        self.get(name).ok_or_else(|| DomainError::NotRegistered {
            domain: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// domain -> healthy
    pub fn health_report(&self) -> BTreeMap<String, bool> {
        self.read()
            .iter()
            .map(|(name, plugin)| (name.clone(), plugin.is_healthy()))
            .collect()
    }
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRegistry")
            .field("domains", &self.names())
            .finish()
    }
}
