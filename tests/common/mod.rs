//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    NFSVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, PersistentVolumeStatus,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use csiraid::adapters::{InMemoryCluster, InMemoryEventCollector};
use csiraid::config::ControllerConfig;
use csiraid::domain::volume::ANN_PROVISIONED_BY;
use csiraid::domain::{LeaseLock, LeaseRecord, ProvisionOptions, Provisioner, ProvisioningState};
use csiraid::{Error, ProvisionController, ProvisionMetrics, Result};

pub const PROVISIONER: &str = "foo.bar/baz";
pub const OTHER_PROVISIONER: &str = "abc.def/ghi";
pub const ALIAS_PROVISIONER: &str = "foo.xyz/baz";

pub fn new_claim(name: &str, uid: &str, class: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some("default".into()),
            uid: Some(uid.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into(), "ReadOnlyMany".into()]),
            storage_class_name: Some(class.into()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity("1Mi".into()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn new_storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        provisioner: provisioner.into(),
        reclaim_policy: Some("Delete".into()),
        ..Default::default()
    }
}

/// A released volume this controller provisioned, ready for deletion
pub fn new_released_volume(name: &str, class: &str, provisioned_by: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            annotations: Some(BTreeMap::from([(
                ANN_PROVISIONED_BY.to_string(),
                provisioned_by.to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            persistent_volume_reclaim_policy: Some("Delete".into()),
            storage_class_name: Some(class.into()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeStatus {
            phase: Some("Released".into()),
            ..Default::default()
        }),
    }
}

/// A volume bound to a claim, as a background provisioner would create it
pub fn new_bound_volume(name: &str, claim_uid: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                uid: Some(claim_uid.into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Short timings so scenarios finish in well under a second
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        additional_provisioner_names: vec![ALIAS_PROVISIONER.into()],
        resync_period: Duration::from_millis(100),
        threadiness: 2,
        create_provisioned_pv_interval: Duration::from_millis(10),
        create_provisioned_pv_max_delay: Duration::from_millis(50),
        claim_retry_base_delay: Duration::from_millis(10),
        claim_retry_max_delay: Duration::from_millis(50),
        ..ControllerConfig::new(PROVISIONER)
    }
}

// =============================================================================
// Test Provisioner
// =============================================================================

type Responder = Box<dyn Fn(&ProvisionOptions) -> Result<ProvisioningState> + Send + Sync>;

/// Provisioner that sleeps, then answers with a configurable response.
pub struct TestProvisioner {
    latency: Duration,
    respond: Responder,
    provision_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl TestProvisioner {
    /// Answers `Finished` with an NFS volume after `latency`
    pub fn new(latency: Duration) -> Arc<Self> {
        Self::with_response(latency, |options| {
            Ok(ProvisioningState::Finished(Box::new(PersistentVolume {
                metadata: ObjectMeta {
                    name: Some(options.volume_name.clone()),
                    ..Default::default()
                },
                spec: Some(PersistentVolumeSpec {
                    nfs: Some(NFSVolumeSource {
                        server: "foo".into(),
                        path: "bar".into(),
                        read_only: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })))
        })
    }

    pub fn with_response<F>(latency: Duration, respond: F) -> Arc<Self>
    where
        F: Fn(&ProvisionOptions) -> Result<ProvisioningState> + Send + Sync + 'static,
    {
        Arc::new(Self {
            latency,
            respond: Box::new(respond),
            provision_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        })
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for TestProvisioner {
    async fn provision(&self, options: ProvisionOptions) -> Result<ProvisioningState> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        (self.respond)(&options)
    }

    async fn delete(&self, _volume: &PersistentVolume) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Partitioned Lease Lock
// =============================================================================

/// One replica's view of a shared lease; `partition` cuts just that replica off.
pub struct PartitionedLeaseLock {
    inner: Arc<dyn LeaseLock>,
    partitioned: AtomicBool,
}

impl PartitionedLeaseLock {
    pub fn new(inner: Arc<dyn LeaseLock>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            partitioned: AtomicBool::new(false),
        })
    }

    pub fn partition(&self, partitioned: bool) {
        self.partitioned.store(partitioned, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.partitioned.load(Ordering::SeqCst) {
            return Err(Error::Api("lease unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseLock for PartitionedLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.check()?;
        self.inner.get().await
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool> {
        self.check()?;
        self.inner.create(record).await
    }

    async fn update(&self, record: &LeaseRecord) -> Result<bool> {
        self.check()?;
        self.inner.update(record).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A running controller and the handles tests poke at.
pub struct Harness {
    pub controller: Arc<ProvisionController>,
    pub cluster: Arc<InMemoryCluster>,
    pub provisioner: Arc<TestProvisioner>,
    pub events: Arc<InMemoryEventCollector>,
    pub metrics: ProvisionMetrics,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    pub fn start(
        config: ControllerConfig,
        cluster: Arc<InMemoryCluster>,
        provisioner: Arc<TestProvisioner>,
    ) -> Self {
        Self::start_with_lock(config, cluster, provisioner, None)
    }

    /// Start a replica campaigning on `lock` when one is given
    pub fn start_with_lock(
        config: ControllerConfig,
        cluster: Arc<InMemoryCluster>,
        provisioner: Arc<TestProvisioner>,
        lock: Option<Arc<dyn LeaseLock>>,
    ) -> Self {
        let events = Arc::new(InMemoryEventCollector::new());
        let metrics = ProvisionMetrics::new("test").unwrap();
        let mut builder =
            ProvisionController::builder(config, cluster.clone(), provisioner.clone())
                .metrics(metrics.clone())
                .event_publisher(events.clone());
        if let Some(lock) = lock {
            builder = builder.lease_lock(lock);
        }
        let controller = builder.build().unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&controller).run(shutdown.clone()));

        Self {
            controller,
            cluster,
            provisioner,
            events,
            metrics,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("controller did not stop")
            .expect("controller task panicked");
        assert!(result.is_ok());
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
