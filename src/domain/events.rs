//! Domain Events
//!
//! This module defines domain events that represent significant occurrences
//! in the controller. Events are immutable records of things that have happened.
//!
//! # Usage
//!
//! Domain events are used for:
//! - Audit logging
//! - Decoupling components
//! - Asserting on controller behaviour in tests
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::provisioning_succeeded("default/claim-1", "pvc-uid-1", "class-1");
//!
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event representing a significant occurrence in the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Provisioning Events
    // =========================================================================
    /// A volume was provisioned for a claim and handed to the volume store.
    ProvisioningSucceeded {
        claim: String,
        volume: String,
        storage_class: String,
        timestamp: DateTime<Utc>,
    },

    /// Provisioning a claim failed.
    ProvisioningFailed {
        claim: String,
        storage_class: String,
        reason: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },

    /// The provisioner continues the work in the background.
    ProvisioningInBackground {
        claim: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Persistence Events
    // =========================================================================
    /// A provisioned volume was saved to the cluster.
    VolumePersisted {
        volume: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Saving a provisioned volume failed and was queued for retry.
    VolumePersistFailed {
        volume: String,
        attempt: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A provisioned volume was dropped after too many save attempts.
    VolumePersistAbandoned {
        volume: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Deletion Events
    // =========================================================================
    /// A released volume was deleted.
    VolumeDeleted {
        volume: String,
        storage_class: String,
        timestamp: DateTime<Utc>,
    },

    /// Deleting a released volume failed.
    VolumeDeleteFailed {
        volume: String,
        storage_class: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Leadership Events
    // =========================================================================
    /// This replica became the leader.
    LeadershipAcquired {
        identity: String,
        lease: String,
        timestamp: DateTime<Utc>,
    },

    /// This replica stopped being the leader.
    LeadershipLost {
        identity: String,
        lease: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::ProvisioningSucceeded { timestamp, .. } => *timestamp,
            DomainEvent::ProvisioningFailed { timestamp, .. } => *timestamp,
            DomainEvent::ProvisioningInBackground { timestamp, .. } => *timestamp,
            DomainEvent::VolumePersisted { timestamp, .. } => *timestamp,
            DomainEvent::VolumePersistFailed { timestamp, .. } => *timestamp,
            DomainEvent::VolumePersistAbandoned { timestamp, .. } => *timestamp,
            DomainEvent::VolumeDeleted { timestamp, .. } => *timestamp,
            DomainEvent::VolumeDeleteFailed { timestamp, .. } => *timestamp,
            DomainEvent::LeadershipAcquired { timestamp, .. } => *timestamp,
            DomainEvent::LeadershipLost { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ProvisioningSucceeded { .. } => "ProvisioningSucceeded",
            DomainEvent::ProvisioningFailed { .. } => "ProvisioningFailed",
            DomainEvent::ProvisioningInBackground { .. } => "ProvisioningInBackground",
            DomainEvent::VolumePersisted { .. } => "VolumePersisted",
            DomainEvent::VolumePersistFailed { .. } => "VolumePersistFailed",
            DomainEvent::VolumePersistAbandoned { .. } => "VolumePersistAbandoned",
            DomainEvent::VolumeDeleted { .. } => "VolumeDeleted",
            DomainEvent::VolumeDeleteFailed { .. } => "VolumeDeleteFailed",
            DomainEvent::LeadershipAcquired { .. } => "LeadershipAcquired",
            DomainEvent::LeadershipLost { .. } => "LeadershipLost",
        }
    }

    /// Get the claim key if applicable.
    pub fn claim(&self) -> Option<&str> {
        match self {
            DomainEvent::ProvisioningSucceeded { claim, .. } => Some(claim),
            DomainEvent::ProvisioningFailed { claim, .. } => Some(claim),
            DomainEvent::ProvisioningInBackground { claim, .. } => Some(claim),
            _ => None,
        }
    }

    /// Get the volume name if applicable.
    pub fn volume(&self) -> Option<&str> {
        match self {
            DomainEvent::ProvisioningSucceeded { volume, .. } => Some(volume),
            DomainEvent::VolumePersisted { volume, .. } => Some(volume),
            DomainEvent::VolumePersistFailed { volume, .. } => Some(volume),
            DomainEvent::VolumePersistAbandoned { volume, .. } => Some(volume),
            DomainEvent::VolumeDeleted { volume, .. } => Some(volume),
            DomainEvent::VolumeDeleteFailed { volume, .. } => Some(volume),
            _ => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl DomainEvent {
    /// Create a ProvisioningSucceeded event.
    pub fn provisioning_succeeded(
        claim: impl Into<String>,
        volume: impl Into<String>,
        storage_class: impl Into<String>,
    ) -> Self {
        DomainEvent::ProvisioningSucceeded {
            claim: claim.into(),
            volume: volume.into(),
            storage_class: storage_class.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a ProvisioningFailed event.
    pub fn provisioning_failed(
        claim: impl Into<String>,
        storage_class: impl Into<String>,
        reason: impl Into<String>,
        will_retry: bool,
    ) -> Self {
        DomainEvent::ProvisioningFailed {
            claim: claim.into(),
            storage_class: storage_class.into(),
            reason: reason.into(),
            will_retry,
            timestamp: Utc::now(),
        }
    }

    /// Create a ProvisioningInBackground event.
    pub fn provisioning_in_background(claim: impl Into<String>) -> Self {
        DomainEvent::ProvisioningInBackground {
            claim: claim.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a VolumePersisted event.
    pub fn volume_persisted(volume: impl Into<String>, attempts: u32) -> Self {
        DomainEvent::VolumePersisted {
            volume: volume.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    /// Create a VolumePersistFailed event.
    pub fn volume_persist_failed(
        volume: impl Into<String>,
        attempt: u32,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::VolumePersistFailed {
            volume: volume.into(),
            attempt,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a VolumePersistAbandoned event.
    pub fn volume_persist_abandoned(volume: impl Into<String>, attempts: u32) -> Self {
        DomainEvent::VolumePersistAbandoned {
            volume: volume.into(),
            attempts,
            timestamp: Utc::now(),
        }
    }

    /// Create a VolumeDeleted event.
    pub fn volume_deleted(volume: impl Into<String>, storage_class: impl Into<String>) -> Self {
        DomainEvent::VolumeDeleted {
            volume: volume.into(),
            storage_class: storage_class.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a VolumeDeleteFailed event.
    pub fn volume_delete_failed(
        volume: impl Into<String>,
        storage_class: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        DomainEvent::VolumeDeleteFailed {
            volume: volume.into(),
            storage_class: storage_class.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a LeadershipAcquired event.
    pub fn leadership_acquired(identity: impl Into<String>, lease: impl Into<String>) -> Self {
        DomainEvent::LeadershipAcquired {
            identity: identity.into(),
            lease: lease.into(),
            timestamp: Utc::now(),
        }
    }

    /// Create a LeadershipLost event.
    pub fn leadership_lost(identity: impl Into<String>, lease: impl Into<String>) -> Self {
        DomainEvent::LeadershipLost {
            identity: identity.into(),
            lease: lease.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
