//! Volume Store
//!
//! Durable write-back of provisioned volumes. A volume whose first create
//! call fails is parked in a pending map and retried from a rate-limited
//! queue keyed by volume name, so repeated failures of one volume lengthen
//! its backoff instead of spawning parallel retries.
//!
//! ```text
//!  store_volume ──create──▶ ok ─────────────────────────▶ Created
//!       │
//!       └─fail─▶ pending[name] ─▶ queue ─▶ worker ──create──▶ ok / exists ─▶ removed
//!                     ▲                              │
//!                     └──────── backoff ◀────fail────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use k8s_openapi::api::core::v1::PersistentVolume;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::workqueue::WorkQueue;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{ClusterApi, EventPublisher, Provisioner};
use crate::error::{Error, Result};

/// Result of handing a volume to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Saved on the first attempt
    Created,
    /// First attempt failed, retried in the background
    Queued,
}

#[derive(Debug, Clone)]
struct PendingVolume {
    volume: PersistentVolume,
    /// Failed create attempts so far
    retries: u32,
}

/// Retry queue for volumes that could not be saved.
pub struct VolumeStoreQueue {
    api: Arc<dyn ClusterApi>,
    provisioner: Arc<dyn Provisioner>,
    events: Arc<dyn EventPublisher>,
    queue: Arc<WorkQueue>,
    volumes: DashMap<String, PendingVolume>,
    max_retries: Option<u32>,
}

impl VolumeStoreQueue {
    pub fn new(
        api: Arc<dyn ClusterApi>,
        provisioner: Arc<dyn Provisioner>,
        events: Arc<dyn EventPublisher>,
        interval: Duration,
        max_delay: Duration,
        max_retries: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            provisioner,
            events,
            queue: WorkQueue::new("volume-store", interval, max_delay),
            volumes: DashMap::new(),
            max_retries,
        })
    }

    /// Save a provisioned volume, queueing it for retry if the save fails.
    pub async fn store_volume(&self, volume: PersistentVolume) -> Result<StoreOutcome> {
        let name = volume
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::Internal("provisioned volume has no name".into()))?;

        match self.api.create_volume(&volume).await {
            Ok(_) => {
                info!(volume = %name, "Volume saved");
                Ok(StoreOutcome::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(volume = %name, "Volume already exists");
                Ok(StoreOutcome::Created)
            }
            Err(e) => {
                warn!(volume = %name, error = %e, "Failed to save volume, queueing for retry");
                self.volumes.insert(
                    name.clone(),
                    PendingVolume {
                        volume,
                        retries: 0,
                    },
                );
                self.record_failure(&name, &e).await;
                Ok(StoreOutcome::Queued)
            }
        }
    }

    /// Retry worker, runs until `token` is cancelled.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        debug!("Volume store worker started");
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => break,
                key = self.queue.get() => key,
            };
            self.retry(&key).await;
            self.queue.done(&key);
        }
        debug!(pending = self.volumes.len(), "Volume store worker stopped");
    }

    async fn retry(&self, name: &str) {
        let volume = match self.volumes.get(name) {
            Some(pending) => pending.volume.clone(),
            None => {
                self.queue.forget(name);
                return;
            }
        };

        match self.api.create_volume(&volume).await {
            Ok(_) => self.saved(name).await,
            Err(e) if e.is_already_exists() => self.saved(name).await,
            Err(e) => {
                warn!(volume = %name, error = %e, "Retry of volume save failed");
                self.record_failure(name, &e).await;
            }
        }
    }

    async fn saved(&self, name: &str) {
        let attempts = self
            .volumes
            .remove(name)
            .map(|(_, p)| p.retries + 1)
            .unwrap_or(1);
        self.queue.forget(name);
        info!(volume = %name, attempts, "Volume saved after retry");
        self.publish(DomainEvent::volume_persisted(name, attempts)).await;
    }

    async fn record_failure(&self, name: &str, err: &Error) {
        let retries = match self.volumes.get_mut(name) {
            Some(mut pending) => {
                pending.retries += 1;
                pending.retries
            }
            None => return,
        };

        if self.max_retries.is_some_and(|max| retries >= max) {
            self.abandon(name, retries).await;
            return;
        }

        self.publish(DomainEvent::volume_persist_failed(
            name,
            retries,
            err.to_string(),
        ))
        .await;
        self.queue.add_rate_limited(name);
    }

    async fn abandon(&self, name: &str, attempts: u32) {
        let Some((_, pending)) = self.volumes.remove(name) else {
            return;
        };
        self.queue.forget(name);
        error!(volume = %name, attempts, "Giving up saving volume, releasing backing storage");
        self.publish(DomainEvent::volume_persist_abandoned(name, attempts))
            .await;

        if let Err(e) = self.provisioner.delete(&pending.volume).await {
            if !e.is_ignored() {
                error!(volume = %name, error = %e, "Failed to release storage of abandoned volume");
            }
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }

    /// Whether `name` is waiting to be saved
    pub fn contains(&self, name: &str) -> bool {
        self.volumes.contains_key(name)
    }

    /// Pending volume by name
    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.get(name).map(|p| p.volume.clone())
    }

    /// Names of all volumes waiting to be saved
    pub fn pending(&self) -> Vec<String> {
        self.volumes.iter().map(|e| e.key().clone()).collect()
    }

    /// Failed attempts of a pending volume
    pub fn retry_count(&self, name: &str) -> Option<u32> {
        self.volumes.get(name).map(|p| p.retries)
    }

    /// Backoff step of a pending volume
    pub fn num_requeues(&self, name: &str) -> u32 {
        self.queue.num_requeues(name)
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::InMemoryCluster;
    use crate::adapters::InMemoryEventCollector;
    use crate::domain::ports::{ProvisionOptions, ProvisioningState};
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingProvisioner {
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provisioner for RecordingProvisioner {
        async fn provision(&self, _options: ProvisionOptions) -> Result<ProvisioningState> {
            Ok(ProvisioningState::NoChange)
        }

        async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
            self.deleted
                .lock()
                .push(volume.metadata.name.clone().unwrap_or_default());
            Ok(())
        }
    }

    fn volume(name: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Fixture {
        cluster: Arc<InMemoryCluster>,
        provisioner: Arc<RecordingProvisioner>,
        events: Arc<InMemoryEventCollector>,
        store: Arc<VolumeStoreQueue>,
    }

    fn fixture(max_retries: Option<u32>) -> Fixture {
        let cluster = InMemoryCluster::new();
        let provisioner = Arc::new(RecordingProvisioner::default());
        let events = Arc::new(InMemoryEventCollector::new());
        let store = VolumeStoreQueue::new(
            cluster.clone(),
            provisioner.clone(),
            events.clone(),
            Duration::from_millis(5),
            Duration::from_millis(20),
            max_retries,
        );
        Fixture {
            cluster,
            provisioner,
            events,
            store,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_store_succeeds_first_time() {
        let f = fixture(None);
        let outcome = f.store.store_volume(volume("pvc-1")).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Created);
        assert!(f.store.is_empty());
        assert!(f.cluster.volume("pvc-1").is_some());
    }

    #[tokio::test]
    async fn test_existing_volume_counts_as_saved() {
        let f = fixture(None);
        f.cluster.add_volume(volume("pvc-1"));
        let outcome = f.store.store_volume(volume("pvc-1")).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Created);
        assert!(f.store.is_empty());
    }

    #[tokio::test]
    async fn test_failed_volume_retried_until_saved() {
        let f = fixture(None);
        f.cluster.fail_next_creates(2);

        let outcome = f.store.store_volume(volume("pvc-1")).await.unwrap();
        assert_eq!(outcome, StoreOutcome::Queued);
        assert!(f.store.contains("pvc-1"));
        assert_eq!(f.store.retry_count("pvc-1"), Some(1));

        let token = CancellationToken::new();
        let worker = tokio::spawn(f.store.clone().run(token.clone()));

        assert!(wait_until(|| f.cluster.volume("pvc-1").is_some()).await);
        assert!(wait_until(|| !f.store.contains("pvc-1")).await);
        assert_eq!(f.cluster.create_calls(), 3);
        assert_eq!(f.store.num_requeues("pvc-1"), 0);
        assert_eq!(f.events.count_of_type("VolumePersistFailed"), 2);
        assert_eq!(f.events.count_of_type("VolumePersisted"), 1);

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_volume_stays_queued() {
        let f = fixture(None);
        f.cluster.fail_all_creates(true);

        f.store.store_volume(volume("pvc-1")).await.unwrap();
        let token = CancellationToken::new();
        let worker = tokio::spawn(f.store.clone().run(token.clone()));

        assert!(wait_until(|| f.store.retry_count("pvc-1").unwrap_or(0) >= 3).await);
        assert!(f.store.contains("pvc-1"));
        assert_eq!(f.store.pending(), vec!["pvc-1".to_string()]);
        assert!(f.cluster.volume("pvc-1").is_none());

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_after_max_retries() {
        let f = fixture(Some(3));
        f.cluster.fail_all_creates(true);

        f.store.store_volume(volume("pvc-1")).await.unwrap();
        let token = CancellationToken::new();
        let worker = tokio::spawn(f.store.clone().run(token.clone()));

        assert!(wait_until(|| !f.store.contains("pvc-1")).await);
        assert_eq!(f.cluster.create_calls(), 3);
        assert_eq!(f.events.count_of_type("VolumePersistAbandoned"), 1);
        assert_eq!(*f.provisioner.deleted.lock(), vec!["pvc-1".to_string()]);

        token.cancel();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_unnamed_volume_rejected() {
        let f = fixture(None);
        let result = f.store.store_volume(PersistentVolume::default()).await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }
}
