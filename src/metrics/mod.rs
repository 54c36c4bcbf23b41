//! Metrics module
//!
//! Per storage class counters of provisioning and deletion outcomes,
//! exposed in the Prometheus text format.

mod recorder;

pub use recorder::{MetricsSnapshot, OutcomeCount, ProvisionMetrics, DEFAULT_SUBSYSTEM};
