//! Read-through cache of the watched collection.
//!
//! Writers (the informer) publish a fresh map on every change; readers load the
//! current map without locking, so workers may read concurrently with ingest.

use std::sync::Arc;

use arc_swap::ArcSwap;
use kube::core::DynamicObject;
use rekon_core::{KeyError, ObjectKey};
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::key_of;

/// One published version of the cache contents.
pub type Snapshot = FxHashMap<ObjectKey, Arc<DynamicObject>>;

type Items = Snapshot;

#[derive(Clone)]
pub struct Store {
    items: Arc<ArcSwap<Items>>,
    synced: Arc<watch::Sender<bool>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        Self { items: Arc::new(ArcSwap::from_pointee(Items::default())), synced: Arc::new(synced) }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.items.load().get(key).cloned()
    }

    pub fn list(&self) -> Vec<Arc<DynamicObject>> {
        self.items.load().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.items.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace an object, returning the previously cached version.
    pub fn apply(&self, obj: Arc<DynamicObject>) -> Result<Option<Arc<DynamicObject>>, KeyError> {
        let key = key_of(&obj)?;
        let prev = self.items.rcu(|cur| {
            let mut next = Items::clone(cur);
            next.insert(key.clone(), Arc::clone(&obj));
            next
        });
        Ok(prev.get(&key).cloned())
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        let prev = self.items.rcu(|cur| {
            let mut next = Items::clone(cur);
            next.remove(key);
            next
        });
        prev.get(key).cloned()
    }

    /// The current contents as one consistent snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.items.load_full()
    }

    /// Publish `items` as the whole cache in one step, returning the snapshot it replaced.
    pub fn replace_all(&self, items: Snapshot) -> Arc<Snapshot> {
        self.items.swap(Arc::new(items))
    }

    /// True once the initial list has been loaded.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Resolve once the initial list has been loaded.
    pub async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives as long as this store, so the wait cannot fail.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use std::time::Duration;

    fn cm(ns: &str, name: &str, rv: &str) -> Arc<DynamicObject> {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let mut o = DynamicObject::new(name, &ar).within(ns);
        o.metadata.resource_version = Some(rv.to_string());
        Arc::new(o)
    }

    #[test]
    fn apply_returns_previous_version() {
        let s = Store::new();
        assert!(s.apply(cm("ns", "a", "1")).unwrap().is_none());
        let prev = s.apply(cm("ns", "a", "2")).unwrap().expect("previous");
        assert_eq!(prev.metadata.resource_version.as_deref(), Some("1"));
        let cur = s.get(&ObjectKey::namespaced("ns", "a")).unwrap();
        assert_eq!(cur.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn delete_removes_and_returns_last_known() {
        let s = Store::new();
        s.apply(cm("ns", "a", "1")).unwrap();
        let key = ObjectKey::namespaced("ns", "a");
        assert!(s.delete(&key).is_some());
        assert!(s.get(&key).is_none());
        assert!(s.delete(&key).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let s = Store::new();
        s.apply(cm("ns", "a", "1")).unwrap();
        let held = s.get(&ObjectKey::namespaced("ns", "a")).unwrap();
        s.apply(cm("ns", "a", "2")).unwrap();
        assert_eq!(held.metadata.resource_version.as_deref(), Some("1"));
    }

    #[test]
    fn replace_all_swaps_contents_and_returns_old_snapshot() {
        let s = Store::new();
        s.apply(cm("ns", "old", "1")).unwrap();
        s.apply(cm("ns", "kept", "1")).unwrap();
        let held = s.get(&ObjectKey::namespaced("ns", "kept")).unwrap();

        let mut next = Snapshot::default();
        next.insert(ObjectKey::namespaced("ns", "kept"), cm("ns", "kept", "2"));
        next.insert(ObjectKey::namespaced("ns", "new"), cm("ns", "new", "1"));
        let prev = s.replace_all(next);

        assert_eq!(prev.len(), 2);
        assert!(prev.contains_key(&ObjectKey::namespaced("ns", "old")));
        let mut keys = s.keys();
        keys.sort();
        assert_eq!(keys, vec![ObjectKey::namespaced("ns", "kept"), ObjectKey::namespaced("ns", "new")]);
        assert_eq!(held.metadata.resource_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn wait_for_sync_resolves_after_mark() {
        let s = Store::new();
        assert!(!s.has_synced());
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_for_sync().await })
        };
        tokio::task::yield_now().await;
        s.mark_synced();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("wait_for_sync hung").unwrap();
        assert!(s.has_synced());
        // already synced: returns immediately
        s.wait_for_sync().await;
    }
}
