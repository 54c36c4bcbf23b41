//! Informers and local caches
//!
//! The controller reads claims, classes and volumes from local caches kept
//! up to date by watch streams. Callers may supply pre-built streams through
//! [`Informers`]; otherwise they are opened from the [`ClusterApi`].

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;

use crate::domain::ports::{ClusterApi, EventStream, WatchEvent};

/// Key under which an object is cached
pub trait CacheKey {
    fn cache_key(&self) -> Option<String>;
}

impl CacheKey for PersistentVolumeClaim {
    /// Claims are keyed by uid
    fn cache_key(&self) -> Option<String> {
        self.metadata.uid.clone().filter(|u| !u.is_empty())
    }
}

impl CacheKey for PersistentVolume {
    fn cache_key(&self) -> Option<String> {
        self.metadata.name.clone()
    }
}

impl CacheKey for StorageClass {
    fn cache_key(&self) -> Option<String> {
        self.metadata.name.clone()
    }
}

/// A cache key and the object now stored under it, `None` once removed
pub type Change<K> = (String, Option<Arc<K>>);

/// Read-mostly cache of one resource type.
#[derive(Debug)]
pub struct ObjectCache<K> {
    objects: DashMap<String, Arc<K>>,
}

impl<K> Default for ObjectCache<K> {
    fn default() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }
}

impl<K: CacheKey> ObjectCache<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a watch event, returning the keys it touched.
    ///
    /// A change is `(key, Some(object))` for an upsert and `(key, None)` for
    /// a removal. A restart replaces the whole cache: keys missing from the
    /// relisted set are removed.
    pub fn apply(&self, event: WatchEvent<K>) -> Vec<Change<K>> {
        match event {
            WatchEvent::Applied(obj) => self.upsert(obj).into_iter().collect(),
            WatchEvent::Deleted(obj) => obj
                .cache_key()
                .map(|key| {
                    self.objects.remove(&key);
                    (key, None)
                })
                .into_iter()
                .collect(),
            WatchEvent::Restarted(objects) => {
                let mut changes: Vec<Change<K>> =
                    objects.into_iter().filter_map(|obj| self.upsert(obj)).collect();
                let live: HashSet<&str> = changes.iter().map(|(key, _)| key.as_str()).collect();
                let stale: Vec<String> = self
                    .objects
                    .iter()
                    .filter(|o| !live.contains(o.key().as_str()))
                    .map(|o| o.key().clone())
                    .collect();
                for key in stale {
                    if self.objects.remove(&key).is_some() {
                        changes.push((key, None));
                    }
                }
                changes
            }
        }
    }

    fn upsert(&self, obj: K) -> Option<Change<K>> {
        let key = obj.cache_key()?;
        let obj = Arc::new(obj);
        self.objects.insert(key.clone(), Arc::clone(&obj));
        Some((key, Some(obj)))
    }

    pub fn get(&self, key: &str) -> Option<Arc<K>> {
        self.objects.get(key).map(|o| Arc::clone(o.value()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        self.objects.iter().map(|o| Arc::clone(o.value())).collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|o| o.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Watch streams feeding the controller's caches.
pub struct Informers {
    pub claims: EventStream<PersistentVolumeClaim>,
    pub volumes: EventStream<PersistentVolume>,
    pub classes: EventStream<StorageClass>,
}

impl Informers {
    /// Open watches through the cluster API
    pub fn from_api(api: &dyn ClusterApi) -> Self {
        Self {
            claims: api.watch_claims(),
            volumes: api.watch_volumes(),
            classes: api.watch_classes(),
        }
    }
}

impl std::fmt::Debug for Informers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informers").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn claim(uid: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("claim-1".into()),
                uid: Some(uid.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_claims_cached_by_uid() {
        let cache = ObjectCache::new();
        let changes = cache.apply(WatchEvent::Applied(claim("uid-1")));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "uid-1");
        assert!(changes[0].1.is_some());
        assert!(cache.contains("uid-1"));
        assert_eq!(cache.len(), 1);

        let changes = cache.apply(WatchEvent::Deleted(claim("uid-1")));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "uid-1");
        assert!(changes[0].1.is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_object_without_key_skipped() {
        let cache: ObjectCache<PersistentVolumeClaim> = ObjectCache::new();
        assert!(cache.apply(WatchEvent::Applied(claim(""))).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_restart_evicts_objects_missing_from_relist() {
        let cache = ObjectCache::new();
        cache.apply(WatchEvent::Applied(claim("uid-1")));
        cache.apply(WatchEvent::Applied(claim("uid-2")));

        // uid-2 was deleted while the watch was down
        let changes = cache.apply(WatchEvent::Restarted(vec![claim("uid-1"), claim("uid-3")]));

        let mut keys = cache.keys();
        keys.sort();
        assert_eq!(keys, vec!["uid-1".to_string(), "uid-3".to_string()]);

        let removed: Vec<_> = changes
            .iter()
            .filter(|(_, obj)| obj.is_none())
            .map(|(key, _)| key.as_str())
            .collect();
        assert_eq!(removed, vec!["uid-2"]);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_empty_restart_clears_cache() {
        let cache = ObjectCache::new();
        cache.apply(WatchEvent::Applied(claim("uid-1")));
        let changes = cache.apply(WatchEvent::Restarted(Vec::new()));
        assert_eq!(changes.len(), 1);
        assert!(cache.is_empty());
    }
}
