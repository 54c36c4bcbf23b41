//! In-memory cluster adapters
//!
//! [`InMemoryCluster`] implements [`ClusterApi`] over plain maps and feeds
//! watchers through unbounded channels, replaying the current state to each
//! new watcher. [`InMemoryLeaseLock`] implements [`LeaseLock`] with a
//! version counter. Both carry failure injection hooks so controller
//! behaviour under API errors can be exercised without a cluster.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use parking_lot::Mutex;
use tracing::trace;

use crate::domain::ports::{ClusterApi, EventStream, LeaseLock, LeaseRecord, WatchEvent};
use crate::error::{Error, Result};

// =============================================================================
// Watched Store
// =============================================================================

struct Store<K> {
    objects: BTreeMap<String, K>,
    watchers: Vec<UnboundedSender<WatchEvent<K>>>,
}

impl<K: Clone + Send + 'static> Store<K> {
    fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            watchers: Vec::new(),
        }
    }

    fn broadcast(&mut self, event: WatchEvent<K>) {
        self.watchers
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn apply(&mut self, key: String, obj: K) {
        self.objects.insert(key, obj.clone());
        self.broadcast(WatchEvent::Applied(obj));
    }

    fn remove(&mut self, key: &str) -> Option<K> {
        let obj = self.objects.remove(key)?;
        self.broadcast(WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }

    /// Drop an object without telling watchers, as if it went during a watch gap
    fn remove_unobserved(&mut self, key: &str) -> Option<K> {
        self.objects.remove(key)
    }

    fn relist(&mut self) {
        let objects = self.objects.values().cloned().collect();
        self.broadcast(WatchEvent::Restarted(objects));
    }

    fn watch(&mut self) -> EventStream<K> {
        let (tx, rx) = unbounded();
        let objects = self.objects.values().cloned().collect();
        // receiver is alive, can't fail
        let _ = tx.unbounded_send(WatchEvent::Restarted(objects));
        self.watchers.push(tx);
        rx.boxed()
    }
}

fn claim_store_key(claim: &PersistentVolumeClaim) -> String {
    format!(
        "{}/{}",
        claim.metadata.namespace.as_deref().unwrap_or("default"),
        claim.metadata.name.as_deref().unwrap_or_default()
    )
}

// =============================================================================
// In-Memory Cluster
// =============================================================================

/// Fake cluster API holding claims, classes and volumes in memory.
pub struct InMemoryCluster {
    claims: Mutex<Store<PersistentVolumeClaim>>,
    classes: Mutex<Store<StorageClass>>,
    volumes: Mutex<Store<PersistentVolume>>,
    resource_version: AtomicU64,
    fail_next_creates: AtomicU32,
    fail_all_creates: AtomicBool,
    create_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self {
            claims: Mutex::new(Store::new()),
            classes: Mutex::new(Store::new()),
            volumes: Mutex::new(Store::new()),
            resource_version: AtomicU64::new(1),
            fail_next_creates: AtomicU32::new(0),
            fail_all_creates: AtomicBool::new(false),
            create_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }
}

impl InMemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_version(&self) -> String {
        self.resource_version
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    /// Add or update a claim
    pub fn add_claim(&self, mut claim: PersistentVolumeClaim) {
        claim.metadata.resource_version = Some(self.next_version());
        let key = claim_store_key(&claim);
        self.claims.lock().apply(key, claim);
    }

    pub fn delete_claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.claims.lock().remove(&format!("{}/{}", namespace, name))
    }

    /// Delete a claim without a watch event; watchers only learn of it on relist
    pub fn delete_claim_unobserved(
        &self,
        namespace: &str,
        name: &str,
    ) -> Option<PersistentVolumeClaim> {
        self.claims
            .lock()
            .remove_unobserved(&format!("{}/{}", namespace, name))
    }

    /// Make every watcher relist, as after a dropped watch connection
    pub fn relist_watches(&self) {
        self.claims.lock().relist();
        self.classes.lock().relist();
        self.volumes.lock().relist();
    }

    pub fn claim(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.claims
            .lock()
            .objects
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    /// Add or update a storage class
    pub fn add_class(&self, class: StorageClass) {
        let key = class.metadata.name.clone().unwrap_or_default();
        self.classes.lock().apply(key, class);
    }

    /// Add or update a volume without going through `create_volume`
    pub fn add_volume(&self, mut volume: PersistentVolume) {
        volume.metadata.resource_version = Some(self.next_version());
        let key = volume.metadata.name.clone().unwrap_or_default();
        self.volumes.lock().apply(key, volume);
    }

    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.lock().objects.get(name).cloned()
    }

    pub fn volumes(&self) -> Vec<PersistentVolume> {
        self.volumes.lock().objects.values().cloned().collect()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.lock().objects.len()
    }

    /// Fail the next `n` calls to `create_volume`
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_next_creates.store(n, Ordering::SeqCst);
    }

    /// Fail every call to `create_volume` while set
    pub fn fail_all_creates(&self, fail: bool) {
        self.fail_all_creates.store(fail, Ordering::SeqCst);
    }

    /// Calls to `create_volume`, failed ones included
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> bool {
        if self.fail_all_creates.load(Ordering::SeqCst) {
            return true;
        }
        self.fail_next_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let name = volume.metadata.name.clone().unwrap_or_default();

        if self.injected_failure() {
            trace!(volume = %name, "Injected create failure");
            return Err(Error::Api("fake error".into()));
        }

        let mut store = self.volumes.lock();
        if store.objects.contains_key(&name) {
            return Err(Error::AlreadyExists {
                kind: "PersistentVolume".into(),
                name,
            });
        }
        let mut created = volume.clone();
        created.metadata.resource_version = Some(self.next_version());
        store.apply(name, created.clone());
        Ok(created)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volume(name))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        match self.volumes.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: "PersistentVolume".into(),
                name: name.to_string(),
            }),
        }
    }

    fn watch_claims(&self) -> EventStream<PersistentVolumeClaim> {
        self.claims.lock().watch()
    }

    fn watch_volumes(&self) -> EventStream<PersistentVolume> {
        self.volumes.lock().watch()
    }

    fn watch_classes(&self) -> EventStream<StorageClass> {
        self.classes.lock().watch()
    }
}

// =============================================================================
// In-Memory Lease Lock
// =============================================================================

/// Lease lock with compare-and-swap on a version counter.
#[derive(Debug)]
pub struct InMemoryLeaseLock {
    name: String,
    record: Mutex<Option<LeaseRecord>>,
    version: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryLeaseLock {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            record: Mutex::new(None),
            version: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Make every call fail while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        self.record.lock().clone()
    }

    pub fn holder(&self) -> Option<String> {
        self.record
            .lock()
            .as_ref()
            .and_then(|r| r.holder_identity.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Api(format!("lease {} unavailable", self.name)));
        }
        Ok(())
    }

    fn stamp(&self, record: &LeaseRecord) -> LeaseRecord {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        LeaseRecord {
            version: Some(version.to_string()),
            ..record.clone()
        }
    }
}

#[async_trait]
impl LeaseLock for InMemoryLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.check_available()?;
        Ok(self.record())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool> {
        self.check_available()?;
        let mut current = self.record.lock();
        if current.is_some() {
            return Ok(false);
        }
        *current = Some(self.stamp(record));
        Ok(true)
    }

    async fn update(&self, record: &LeaseRecord) -> Result<bool> {
        self.check_available()?;
        let mut current = self.record.lock();
        match current.as_ref() {
            Some(existing) if existing.version == record.version => {
                *current = Some(self.stamp(record));
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound {
                kind: "Lease".into(),
                name: self.name.clone(),
            }),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::time::Duration;

    fn volume(name: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_delete_volume() {
        let cluster = InMemoryCluster::new();
        cluster.create_volume(&volume("pv-1")).await.unwrap();
        assert!(cluster.get_volume("pv-1").await.unwrap().is_some());

        let err = cluster.create_volume(&volume("pv-1")).await.unwrap_err();
        assert!(err.is_already_exists());

        cluster.delete_volume("pv-1").await.unwrap();
        let err = cluster.delete_volume("pv-1").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cluster.create_calls(), 2);
        assert_eq!(cluster.delete_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_create_failures() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_creates(2);
        assert!(cluster.create_volume(&volume("pv-1")).await.is_err());
        assert!(cluster.create_volume(&volume("pv-1")).await.is_err());
        assert!(cluster.create_volume(&volume("pv-1")).await.is_ok());
        assert_eq!(cluster.volume_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_replays_and_follows() {
        let cluster = InMemoryCluster::new();
        cluster.add_volume(volume("pv-1"));

        let mut watch = cluster.watch_volumes();
        let first = watch.next().await.unwrap();
        assert!(matches!(&first, WatchEvent::Restarted(v) if v.len() == 1));

        cluster.delete_volume("pv-1").await.unwrap();
        let second = watch.next().await.unwrap();
        assert!(matches!(second, WatchEvent::Deleted(_)));

        cluster.add_volume(volume("pv-2"));
        let third = watch.next().await.unwrap();
        assert!(matches!(third, WatchEvent::Applied(v) if v.metadata.name.as_deref() == Some("pv-2")));
    }

    #[tokio::test]
    async fn test_unobserved_delete_shows_on_relist() {
        let cluster = InMemoryCluster::new();
        let mut claim = PersistentVolumeClaim::default();
        claim.metadata.name = Some("claim-1".into());
        claim.metadata.namespace = Some("default".into());
        cluster.add_claim(claim);

        let mut watch = cluster.watch_claims();
        assert!(matches!(watch.next().await.unwrap(), WatchEvent::Restarted(c) if c.len() == 1));

        assert!(cluster.delete_claim_unobserved("default", "claim-1").is_some());
        cluster.relist_watches();
        assert!(matches!(watch.next().await.unwrap(), WatchEvent::Restarted(c) if c.is_empty()));
    }

    #[tokio::test]
    async fn test_lease_compare_and_swap() {
        let lock = InMemoryLeaseLock::new("default/test");
        let record = LeaseRecord::acquired("a", Duration::from_secs(10), Utc::now());

        assert!(lock.create(&record).await.unwrap());
        assert!(!lock.create(&record).await.unwrap());

        let current = lock.get().await.unwrap().unwrap();
        assert!(lock.update(&current).await.unwrap());
        // stale version is rejected
        assert!(!lock.update(&current).await.unwrap());

        lock.set_unavailable(true);
        assert!(lock.get().await.is_err());
    }
}
