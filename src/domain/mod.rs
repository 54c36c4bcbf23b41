//! Domain Layer
//!
//! This module contains the core abstractions of the provisioning controller.
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the provisioner plug-in,
//!   the cluster API, the lease lock and event publishing
//! - **Events** (`events.rs`) - Domain events for audit and decoupling
//! - **Volume** (`volume.rs`) - Annotations and claim/volume accessors
//!
//! # Usage
//!
//! ```ignore
//! use csiraid::domain::ports::{Provisioner, ProvisionOptions, ProvisioningState};
//!
//! struct MyBackend;
//!
//! #[async_trait]
//! impl Provisioner for MyBackend {
//!     async fn provision(&self, options: ProvisionOptions) -> Result<ProvisioningState> {
//!         // allocate storage, describe it as a PersistentVolume
//!     }
//!     async fn delete(&self, volume: &PersistentVolume) -> Result<()> {
//!         // release it again
//!     }
//! }
//! ```

pub mod events;
pub mod ports;
pub mod volume;

// Re-export commonly used types
pub use events::DomainEvent;
pub use ports::{
    BlockProvisioner, ClusterApi, EventPublisher, EventStream, LeaseLock, LeaseRecord,
    ProvisionOptions, Provisioner, ProvisionerCapabilities, ProvisioningState, Qualifier,
    WatchEvent,
};
