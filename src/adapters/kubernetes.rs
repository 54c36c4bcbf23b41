//! Kubernetes Adapters
//!
//! Implements the `ClusterApi` port over PersistentVolumes, claims and
//! storage classes, and the `LeaseLock` port over a
//! `coordination.k8s.io/v1` Lease.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use crate::domain::ports::{ClusterApi, EventStream, LeaseLock, LeaseRecord, WatchEvent};
use crate::error::{Error, Result};

// =============================================================================
// Cluster API
// =============================================================================

/// Cluster API backed by a kube client.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi").finish_non_exhaustive()
    }
}

/// Watch all objects of `K`, restarting with backoff on errors.
///
/// Objects of a (re)list are buffered and handed over as one
/// [`WatchEvent::Restarted`], so objects deleted during a watch gap are
/// dropped from the caches.
fn watch_all<K>(api: Api<K>) -> EventStream<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
{
    watcher::watcher(api, watcher::Config::default())
        .default_backoff()
        .scan(Vec::new(), |relist, event| {
            future::ready(Some(relist_event(relist, event)))
        })
        .filter_map(future::ready)
        .boxed()
}

fn relist_event<K>(relist: &mut Vec<K>, event: watcher::Result<Event<K>>) -> Option<WatchEvent<K>> {
    match event {
        Ok(Event::Apply(obj)) => Some(WatchEvent::Applied(obj)),
        Ok(Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
        Ok(Event::Init) => {
            relist.clear();
            None
        }
        Ok(Event::InitApply(obj)) => {
            relist.push(obj);
            None
        }
        Ok(Event::InitDone) => Some(WatchEvent::Restarted(std::mem::take(relist))),
        Err(e) => {
            warn!(error = %e, "Watch error");
            None
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self, volume), fields(volume = ?volume.metadata.name))]
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume> {
        match self.volumes().create(&PostParams::default(), volume).await {
            Ok(created) => {
                debug!("Created PersistentVolume");
                Ok(created)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::AlreadyExists {
                kind: "PersistentVolume".into(),
                name: volume.metadata.name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes().get_opt(name).await?)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, name: &str) -> Result<()> {
        match self.volumes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Err(Error::NotFound {
                kind: "PersistentVolume".into(),
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn watch_claims(&self) -> EventStream<PersistentVolumeClaim> {
        watch_all(Api::all(self.client.clone()))
    }

    fn watch_volumes(&self) -> EventStream<PersistentVolume> {
        watch_all(self.volumes())
    }

    fn watch_classes(&self) -> EventStream<StorageClass> {
        watch_all(Api::all(self.client.clone()))
    }
}

// =============================================================================
// Lease Lock
// =============================================================================

/// Lease lock using `resourceVersion` for compare-and-swap.
#[derive(Clone)]
pub struct KubeLeaseLock {
    client: Client,
    name: String,
    namespace: String,
}

impl KubeLeaseLock {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn to_lease(&self, record: &LeaseRecord) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: record.version.clone(),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration.as_secs().max(1) as i32),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }
}

impl std::fmt::Debug for KubeLeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseLock")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .finish()
    }
}

fn to_record(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity.filter(|h| !h.is_empty()),
        lease_duration: Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        version: lease.metadata.resource_version,
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        Ok(self.api().get_opt(&self.name).await?.map(to_record))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool> {
        let mut lease = self.to_lease(record);
        lease.metadata.resource_version = None;
        match self.api().create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %self.name, "Lease creation conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, record: &LeaseRecord) -> Result<bool> {
        if record.version.is_none() {
            return Err(Error::LeaderElection(format!(
                "lease {} has no resourceVersion",
                self.name
            )));
        }
        let lease = self.to_lease(record);
        match self
            .api()
            .replace(&self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(lease = %self.name, "Lease update conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_lease_to_record() {
        let now = Utc::now();
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some("foo.bar-baz".into()),
                resource_version: Some("42".into()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some("replica-a".into()),
                lease_duration_seconds: Some(15),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(3),
                ..Default::default()
            }),
        };

        let record = to_record(lease);
        assert!(record.is_held_by("replica-a"));
        assert_eq!(record.lease_duration, Duration::from_secs(15));
        assert_eq!(record.renew_time, Some(now));
        assert_eq!(record.lease_transitions, 3);
        assert_eq!(record.version.as_deref(), Some("42"));
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

    #[test]
    fn test_relist_is_delivered_whole() {
        let mut relist = vec![volume("stale")];

        assert_eq!(relist_event(&mut relist, Ok(Event::Init)), None);
        assert!(relist.is_empty());
        assert_eq!(relist_event(&mut relist, Ok(Event::InitApply(volume("pv-1")))), None);
        assert_eq!(relist_event(&mut relist, Ok(Event::InitApply(volume("pv-2")))), None);

        let Some(WatchEvent::Restarted(objects)) = relist_event(&mut relist, Ok(Event::InitDone))
        else {
            panic!("expected a restart");
        };
        let names: Vec<_> = objects
            .iter()
            .filter_map(|v| v.metadata.name.as_deref())
            .collect();
        assert_eq!(names, vec!["pv-1", "pv-2"]);
        assert!(relist.is_empty());

        assert_eq!(
            relist_event(&mut relist, Ok(Event::Apply(volume("pv-3")))),
            Some(WatchEvent::Applied(volume("pv-3")))
        );
    }

    #[test]
    fn test_empty_holder_is_none() {
        let lease = Lease {
            spec: Some(LeaseSpec {
                holder_identity: Some(String::new()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let record = to_record(lease);
        assert_eq!(record.holder_identity, None);
        assert!(record.is_expired(Utc::now()));
    }
}
