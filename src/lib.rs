//! csiraid - Dynamic PersistentVolume Provisioning Controller
//!
//! Watches PersistentVolumeClaims and provisions PersistentVolumes for the
//! claims whose storage class names this controller's provisioner. The
//! storage itself is created by a pluggable [`Provisioner`]; the controller
//! owns the claim lifecycle around it.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!  claims ───────▶│              ProvisionController             │
//!  classes ──────▶│  caches ─▶ claim queue ─▶ workers ─┐         │
//!  volumes ──────▶│                                    ▼         │
//!                 │  ClaimsInProgress        Provisioner plug-in │
//!                 │                                    │         │
//!                 │  VolumeStoreQueue ◀────────────────┘         │
//!                 └───────────────┬──────────────────────────────┘
//!                                 │ create PersistentVolume (retried)
//!                                 ▼
//!                           Kubernetes API
//! ```
//!
//! With several replicas running, a Lease elects one leader; only the leader
//! runs workers while every replica keeps its caches warm.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`config`] - Controller and leader election configuration
//! - [`controller`] - Reconciler, queues, caches and the volume store
//! - [`domain`] - Domain layer with ports and events
//! - [`error`] - Error types
//! - [`leader_election`] - Lease based leader election
//! - [`metrics`] - Prometheus provisioning and deletion counters

pub mod adapters;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod leader_election;
pub mod metrics;

// Re-export commonly used types
pub use config::{ControllerConfig, LeaderElectionConfig};
pub use controller::{ProvisionController, ProvisionControllerBuilder, VolumeStoreQueue};
pub use domain::{ProvisionOptions, Provisioner, ProvisioningState};
pub use error::{Error, Result};
pub use leader_election::{LeaderElector, LeaderState};
pub use metrics::ProvisionMetrics;
