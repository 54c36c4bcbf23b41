//! Controller Configuration
//!
//! Tunables for the reconciler, the persistence retry queue and leader
//! election. Every value has a default; `validate()` rejects combinations
//! the controller can't run with.

use std::time::Duration;

use crate::error::{Error, Result};

// =============================================================================
// Controller Configuration
// =============================================================================

/// Configuration for the provisioning controller
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Provisioner name this controller answers to
    pub provisioner_name: String,

    /// Further names accepted as "ours"
    pub additional_provisioner_names: Vec<String>,

    /// Interval at which all cached claims and volumes are re-evaluated
    pub resync_period: Duration,

    /// Number of claim workers (and of volume deletion workers)
    pub threadiness: usize,

    /// Minimum delay between attempts to save a provisioned volume
    pub create_provisioned_pv_interval: Duration,

    /// Upper bound of the save backoff
    pub create_provisioned_pv_max_delay: Duration,

    /// Give up saving a volume after this many failed attempts
    pub max_persist_retries: Option<u32>,

    /// First delay after a failed provisioning attempt
    pub claim_retry_base_delay: Duration,

    /// Upper bound of the provisioning backoff
    pub claim_retry_max_delay: Duration,

    /// Stop retrying a claim after this many consecutive failures (0 = never)
    pub failed_provision_threshold: u32,

    /// Stop retrying a volume deletion after this many consecutive failures (0 = never)
    pub failed_delete_threshold: u32,

    /// Leader election, disabled when `None`
    pub leader_election: Option<LeaderElectionConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            provisioner_name: String::new(),
            additional_provisioner_names: Vec::new(),
            resync_period: Duration::from_secs(15 * 60),
            threadiness: 4,
            create_provisioned_pv_interval: Duration::from_secs(10),
            create_provisioned_pv_max_delay: Duration::from_secs(5 * 60),
            max_persist_retries: None,
            claim_retry_base_delay: Duration::from_secs(15),
            claim_retry_max_delay: Duration::from_secs(1000),
            failed_provision_threshold: 15,
            failed_delete_threshold: 15,
            leader_election: None,
        }
    }
}

impl ControllerConfig {
    /// Default configuration for a provisioner name
    pub fn new(provisioner_name: impl Into<String>) -> Self {
        Self {
            provisioner_name: provisioner_name.into(),
            ..Default::default()
        }
    }

    /// Whether `name` is this controller's name or one of its aliases
    pub fn is_known_provisioner(&self, name: &str) -> bool {
        self.provisioner_name == name
            || self.additional_provisioner_names.iter().any(|n| n == name)
    }

    /// Check the configuration for values the controller can't run with
    pub fn validate(&self) -> Result<()> {
        if self.provisioner_name.is_empty() {
            return Err(Error::Config("provisioner name must not be empty".into()));
        }
        if self.threadiness == 0 {
            return Err(Error::Config("threadiness must be at least 1".into()));
        }
        if self.resync_period.is_zero() {
            return Err(Error::Config("resync period must be positive".into()));
        }
        if self.create_provisioned_pv_interval.is_zero() {
            return Err(Error::Config(
                "create provisioned PV interval must be positive".into(),
            ));
        }
        if self.create_provisioned_pv_max_delay < self.create_provisioned_pv_interval {
            return Err(Error::Config(format!(
                "create provisioned PV max delay ({:?}) is shorter than the interval ({:?})",
                self.create_provisioned_pv_max_delay, self.create_provisioned_pv_interval
            )));
        }
        if self.claim_retry_max_delay < self.claim_retry_base_delay {
            return Err(Error::Config(format!(
                "claim retry max delay ({:?}) is shorter than the base delay ({:?})",
                self.claim_retry_max_delay, self.claim_retry_base_delay
            )));
        }
        if let Some(le) = &self.leader_election {
            le.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Leader Election Configuration
// =============================================================================

/// Configuration for lease based leader election
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Name of the lease object
    pub lease_name: String,

    /// Namespace of the lease object
    pub namespace: String,

    /// Identity recorded as lease holder
    pub identity: String,

    /// How long a lease is valid without renewal
    pub lease_duration: Duration,

    /// How long the leader keeps trying to renew before giving up
    pub renew_deadline: Duration,

    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Default timings, lease named after the provisioner
    pub fn new(
        provisioner_name: &str,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name_for(provisioner_name),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    /// Check timing invariants
    pub fn validate(&self) -> Result<()> {
        if self.lease_name.is_empty() {
            return Err(Error::Config("lease name must not be empty".into()));
        }
        if self.identity.is_empty() {
            return Err(Error::Config("leader identity must not be empty".into()));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::Config(format!(
                "renew deadline ({:?}) must be shorter than lease duration ({:?})",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period.is_zero() || self.retry_period >= self.renew_deadline {
            return Err(Error::Config(format!(
                "retry period ({:?}) must be positive and shorter than renew deadline ({:?})",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Lease name derived from a provisioner name (`/` is not allowed in names)
pub fn lease_name_for(provisioner_name: &str) -> String {
    provisioner_name.replace('/', "-")
}
