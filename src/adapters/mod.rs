//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  Provisioner │ ClusterApi │ LeaseLock │ EventPublisher     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ NfsProvisioner │ KubeClusterApi │ KubeLeaseLock            │ │
//! │  │ InMemoryCluster │ InMemoryLeaseLock │ LoggingEventPublisher│ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use csiraid::adapters::{KubeClusterApi, KubeLeaseLock, NfsProvisioner};
//!
//! let api = Arc::new(KubeClusterApi::new(client.clone()));
//! let lock = Arc::new(KubeLeaseLock::new(client, "kube-system", "example.com-nfs"));
//! let provisioner = Arc::new(NfsProvisioner::new("nfs.local", "/exports"));
//! ```

mod event_publisher;
mod kubernetes;
pub mod memory;
mod nfs;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use kubernetes::{KubeClusterApi, KubeLeaseLock};
pub use memory::{InMemoryCluster, InMemoryLeaseLock};
pub use nfs::NfsProvisioner;
