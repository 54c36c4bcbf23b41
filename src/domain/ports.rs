//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the abstractions the controller depends on.
//! Infrastructure adapters implement these traits to provide concrete
//! implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  Provisioner │ ClusterApi │ LeaseLock │ EventPublisher│   │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  NfsProvisioner │ KubeClusterApi │ KubeLeaseLock    │    │
//! │  │  InMemoryCluster │ InMemoryLeaseLock                │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, TopologySelectorTerm};
use k8s_openapi::api::storage::v1::StorageClass;

use super::events::DomainEvent;
use crate::error::Result;

// =============================================================================
// Provisioner Port
// =============================================================================

/// Everything a provisioner needs to create a volume for a claim.
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Name the created volume must carry
    pub volume_name: String,
    /// The claim being provisioned
    pub claim: PersistentVolumeClaim,
    /// The claim's resolved storage class
    pub storage_class: StorageClass,
    /// Node selected by the scheduler for classes that wait for a consumer
    pub selected_node: Option<String>,
    /// Topology constraints copied from the storage class
    pub allowed_topologies: Vec<TopologySelectorTerm>,
}

/// Control-flow intent returned by a provisioner.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisioningState {
    /// The volume is ready to be persisted
    Finished(Box<PersistentVolume>),
    /// Work continues asynchronously, completion is reported out of band
    InBackground,
    /// Transient failure, try again later
    Reschedule,
    /// Nothing to do
    NoChange,
}

impl ProvisioningState {
    /// Short name used in logs and events
    pub fn name(&self) -> &'static str {
        match self {
            ProvisioningState::Finished(_) => "Finished",
            ProvisioningState::InBackground => "InBackground",
            ProvisioningState::Reschedule => "Reschedule",
            ProvisioningState::NoChange => "NoChange",
        }
    }
}

/// Pluggable storage backend.
///
/// Optional capabilities are advertised through [`Provisioner::qualifier`]
/// and [`Provisioner::block_provisioner`]; the controller resolves them once
/// at construction time.
///
/// Returning [`crate::Error::Ignored`] from either operation tells the
/// controller to drop the item without retrying or counting a failure.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the backing storage and describe it as a volume.
    async fn provision(&self, options: ProvisionOptions) -> Result<ProvisioningState>;

    /// Release the backing storage of a volume.
    async fn delete(&self, volume: &PersistentVolume) -> Result<()>;

    /// Per-claim veto, consulted in addition to provisioner-name matching.
    fn qualifier(&self) -> Option<&dyn Qualifier> {
        None
    }

    /// Raw block support.
    fn block_provisioner(&self) -> Option<&dyn BlockProvisioner> {
        None
    }
}

/// Optional capability: decide per claim whether to provision it.
pub trait Qualifier: Send + Sync {
    fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool;
}

/// Optional capability: raw block volumes.
pub trait BlockProvisioner: Send + Sync {
    fn supports_block(&self) -> bool;
}

/// Capabilities of a provisioner, resolved once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionerCapabilities {
    pub qualifier: bool,
    pub block: bool,
}

impl ProvisionerCapabilities {
    /// Inspect a provisioner
    pub fn of(provisioner: &dyn Provisioner) -> Self {
        Self {
            qualifier: provisioner.qualifier().is_some(),
            block: provisioner
                .block_provisioner()
                .is_some_and(|b| b.supports_block()),
        }
    }
}

// =============================================================================
// Cluster API Port
// =============================================================================

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    /// Object was added or modified
    Applied(K),
    /// Object was removed
    Deleted(K),
    /// The watch relisted; these are all objects that currently exist
    Restarted(Vec<K>),
}

/// Stream of watch events for one resource type.
pub type EventStream<K> = BoxStream<'static, WatchEvent<K>>;

/// Port for the parts of the cluster API the controller uses.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create a volume. Fails with `AlreadyExists` if the name is taken.
    async fn create_volume(&self, volume: &PersistentVolume) -> Result<PersistentVolume>;

    /// Fetch a volume by name.
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Delete a volume by name. Fails with `NotFound` if it doesn't exist.
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Watch claims in all namespaces.
    fn watch_claims(&self) -> EventStream<PersistentVolumeClaim>;

    /// Watch volumes.
    fn watch_volumes(&self) -> EventStream<PersistentVolume>;

    /// Watch storage classes.
    fn watch_classes(&self) -> EventStream<StorageClass>;
}

// =============================================================================
// Lease Port
// =============================================================================

/// Snapshot of a coordination lease.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRecord {
    /// Current holder, `None` when released
    pub holder_identity: Option<String>,
    pub lease_duration: Duration,
    pub acquire_time: Option<DateTime<Utc>>,
    pub renew_time: Option<DateTime<Utc>>,
    pub lease_transitions: i32,
    /// Opaque version used for compare-and-swap
    pub version: Option<String>,
}

impl LeaseRecord {
    /// A fresh lease held by `identity`
    pub fn acquired(identity: &str, lease_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: Some(identity.to_string()),
            lease_duration,
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: 0,
            version: None,
        }
    }

    /// Whether `identity` holds the lease
    pub fn is_held_by(&self, identity: &str) -> bool {
        self.holder_identity.as_deref() == Some(identity)
    }

    /// Whether the lease is free to take at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.holder_identity.is_none() {
            return true;
        }
        match (
            self.renew_time,
            chrono::Duration::from_std(self.lease_duration),
        ) {
            (Some(renewed), Ok(duration)) => now > renewed + duration,
            _ => true,
        }
    }
}

/// Port for a compare-and-swap lease lock.
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Read the lease, `None` if it doesn't exist yet.
    async fn get(&self) -> Result<Option<LeaseRecord>>;

    /// Create the lease. Returns `false` if someone else created it first.
    async fn create(&self, record: &LeaseRecord) -> Result<bool>;

    /// Replace the lease if its version still equals `record.version`.
    /// Returns `false` on conflict.
    async fn update(&self, record: &LeaseRecord) -> Result<bool>;

    /// Human readable lock name, for logs.
    fn describe(&self) -> String;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
///
/// This trait abstracts event publishing, allowing different backends
/// (logging, in-memory, etc.) to be used.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================
