/// Explicit lookup of sync managers by document key.
///
/// Owned by whatever orchestrator constructs managers and passed by
/// reference; there is deliberately no process-global registry.
use std::collections::HashMap;

use crate::SyncManager;

#[derive(Default)]
pub struct ManagerRegistry {
    managers: HashMap<String, SyncManager>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a manager under a document key. Replacing an existing
    /// entry returns the displaced manager so the caller can dispose it.
    pub fn insert(&mut self, key: impl Into<String>, manager: SyncManager) -> Option<SyncManager> {
        self.managers.insert(key.into(), manager)
    }

    pub fn get(&self, key: &str) -> Option<&SyncManager> {
        self.managers.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<SyncManager> {
        self.managers.remove(key)
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    /// Dispose every registered manager and clear the registry.
    pub async fn dispose_all(&mut self) {
        for (_, manager) in self.managers.drain() {
            manager.dispose().await;
        }
    }
}
