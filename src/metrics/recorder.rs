//! Provisioning metrics recorder
//!
//! Four counters, each partitioned by the `class` label:
//!
//! | metric                                             | incremented when                |
//! |----------------------------------------------------|---------------------------------|
//! | `<subsystem>_persistentvolumeclaim_provision_total` | a volume was handed to the store |
//! | `<subsystem>_persistentvolumeclaim_provision_failed_total` | provisioning failed       |
//! | `<subsystem>_persistentvolume_delete_total`         | a released volume was deleted   |
//! | `<subsystem>_persistentvolume_delete_failed_total`  | deleting a volume failed        |

use std::collections::BTreeMap;

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// Subsystem prefix used by the binary
pub const DEFAULT_SUBSYSTEM: &str = "csiraid";

const CLASS_LABEL: &str = "class";

const PROVISION_TOTAL: &str = "persistentvolumeclaim_provision_total";
const PROVISION_FAILED_TOTAL: &str = "persistentvolumeclaim_provision_failed_total";
const DELETE_TOTAL: &str = "persistentvolume_delete_total";
const DELETE_FAILED_TOTAL: &str = "persistentvolume_delete_failed_total";

/// Success and failure count of one class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCount {
    pub success: u64,
    pub failed: u64,
}

/// Counter values by storage class
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub provisioned: BTreeMap<String, OutcomeCount>,
    pub deleted: BTreeMap<String, OutcomeCount>,
}

impl MetricsSnapshot {
    pub fn provision_successes(&self, class: &str) -> u64 {
        self.provisioned.get(class).map_or(0, |c| c.success)
    }

    pub fn provision_failures(&self, class: &str) -> u64 {
        self.provisioned.get(class).map_or(0, |c| c.failed)
    }

    pub fn delete_successes(&self, class: &str) -> u64 {
        self.deleted.get(class).map_or(0, |c| c.success)
    }

    pub fn delete_failures(&self, class: &str) -> u64 {
        self.deleted.get(class).map_or(0, |c| c.failed)
    }
}

/// Provisioning and deletion counters on a private registry.
#[derive(Clone)]
pub struct ProvisionMetrics {
    registry: Registry,
    prefix: String,
    provision_total: IntCounterVec,
    provision_failed_total: IntCounterVec,
    delete_total: IntCounterVec,
    delete_failed_total: IntCounterVec,
}

impl ProvisionMetrics {
    /// Register the counters under `subsystem` (may be empty)
    pub fn new(subsystem: &str) -> Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> Result<IntCounterVec> {
            let opts = Opts::new(name, help).subsystem(subsystem);
            let vec = IntCounterVec::new(opts, &[CLASS_LABEL])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let provision_total = counter(
            PROVISION_TOTAL,
            "Total number of persistent volumes provisioned successfully",
        )?;
        let provision_failed_total = counter(
            PROVISION_FAILED_TOTAL,
            "Total number of persistent volume provision failed attempts",
        )?;
        let delete_total = counter(
            DELETE_TOTAL,
            "Total number of persistent volumes deleted successfully",
        )?;
        let delete_failed_total = counter(
            DELETE_FAILED_TOTAL,
            "Total number of persistent volume delete failed attempts",
        )?;

        let prefix = if subsystem.is_empty() {
            String::new()
        } else {
            format!("{}_", subsystem)
        };

        Ok(Self {
            registry,
            prefix,
            provision_total,
            provision_failed_total,
            delete_total,
            delete_failed_total,
        })
    }

    pub fn record_provision_success(&self, class: &str) {
        self.provision_total.with_label_values(&[class]).inc();
    }

    pub fn record_provision_failure(&self, class: &str) {
        self.provision_failed_total.with_label_values(&[class]).inc();
    }

    pub fn record_delete_success(&self, class: &str) {
        self.delete_total.with_label_values(&[class]).inc();
    }

    pub fn record_delete_failure(&self, class: &str) {
        self.delete_failed_total.with_label_values(&[class]).inc();
    }

    /// The registry holding the counters
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all counters in the text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics not UTF-8: {}", e)))
    }

    /// Current counter values; classes that were never touched are absent
    pub fn snapshot(&self) -> Result<MetricsSnapshot> {
        let mut snapshot = MetricsSnapshot::default();

        for family in self.registry.gather() {
            let Some(name) = family.name().strip_prefix(self.prefix.as_str()) else {
                continue;
            };
            let (map, success) = match name {
                PROVISION_TOTAL => (&mut snapshot.provisioned, true),
                PROVISION_FAILED_TOTAL => (&mut snapshot.provisioned, false),
                DELETE_TOTAL => (&mut snapshot.deleted, true),
                DELETE_FAILED_TOTAL => (&mut snapshot.deleted, false),
                _ => continue,
            };
            for metric in family.get_metric() {
                let Some(class) = metric
                    .get_label()
                    .iter()
                    .find(|l| l.name() == CLASS_LABEL)
                    .map(|l| l.value().to_string())
                else {
                    continue;
                };
                let value = metric.get_counter().value() as u64;
                let entry = map.entry(class).or_default();
                if success {
                    entry.success = value;
                } else {
                    entry.failed = value;
                }
            }
        }

        Ok(snapshot)
    }
}

impl std::fmt::Debug for ProvisionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionMetrics")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
