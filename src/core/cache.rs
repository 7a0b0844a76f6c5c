use std::collections::HashMap;
use std::sync::Mutex;

use crate::binding::PersistFlush;
use crate::core::store::StoreHandle;

#[derive(Debug)]
struct Cached {
    store: StoreHandle,
    persisted: Option<PersistFlush>,
}

/// Mounted stores by project id, for code that lives outside the lifecycle
/// controller.
///
/// The controller is the only writer. Readers must treat `None` as "not
/// mounted yet, try again later" and must fetch a fresh handle for every
/// use instead of holding one across a scheduled pass.
#[derive(Debug, Default)]
pub struct StoreCache {
    stores: Mutex<HashMap<String, Cached>>,
}

impl StoreCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle, replacing any previous one for the same id.
    pub fn put(&self, entity_id: &str, handle: StoreHandle) {
        self.insert(entity_id, handle, None);
    }

    /// Register a handle whose writes reach disk through `persisted`.
    pub fn put_persisted(&self, entity_id: &str, handle: StoreHandle, persisted: PersistFlush) {
        self.insert(entity_id, handle, Some(persisted));
    }

    pub fn remove(&self, entity_id: &str) -> Option<StoreHandle> {
        self.lock().remove(entity_id).map(|cached| cached.store)
    }

    pub fn get(&self, entity_id: &str) -> Option<StoreHandle> {
        self.lock().get(entity_id).map(|cached| cached.store.clone())
    }

    /// Wait until everything written to the mounted store is on disk. No-op
    /// for stores that are not mounted or not persisted.
    pub async fn flush(&self, entity_id: &str) {
        let persisted = self
            .lock()
            .get(entity_id)
            .and_then(|cached| cached.persisted.clone());
        if let Some(persisted) = persisted {
            persisted.flush().await;
        }
    }

    fn insert(&self, entity_id: &str, store: StoreHandle, persisted: Option<PersistFlush>) {
        self.lock()
            .insert(entity_id.to_string(), Cached { store, persisted });
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.lock().contains_key(entity_id)
    }

    pub fn entity_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Cached>> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::{Store, StoreId};
    use std::sync::Arc;

    #[test]
    fn put_overwrites_and_remove_clears() {
        let cache = StoreCache::new();
        assert!(cache.get("p1").is_none());

        let first = Store::new(StoreId::per_entity("project", "p1"));
        let second = Store::new(StoreId::per_entity("project", "p1"));
        cache.put("p1", first);
        cache.put("p1", second.clone());
        assert!(Arc::ptr_eq(&cache.get("p1").unwrap(), &second));
        assert_eq!(cache.entity_ids(), vec!["p1"]);

        assert!(cache.remove("p1").is_some());
        assert!(cache.get("p1").is_none());
        assert!(cache.remove("p1").is_none());
    }
}
