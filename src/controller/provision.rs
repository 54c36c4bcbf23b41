//! Provision Controller
//!
//! Watches claims, storage classes and volumes, provisions volumes for the
//! claims this controller is responsible for and deletes released volumes
//! it created.
//!
//! ```text
//!  claims ─┐                       ┌─▶ claim workers ──▶ Provisioner ──▶ VolumeStore
//!  classes ├─▶ caches ─▶ queues ───┤
//!  volumes ┘                       └─▶ volume workers ─▶ Provisioner::delete
//! ```
//!
//! Watches and resync run on every replica so caches and queues stay warm;
//! workers only run while this replica leads.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::in_progress::{ClaimsInProgress, InProgressGuard};
use super::informer::{Informers, ObjectCache};
use super::volume_store::{StoreOutcome, VolumeStoreQueue};
use super::workqueue::WorkQueue;
use crate::adapters::LoggingEventPublisher;
use crate::config::ControllerConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    ClusterApi, EventPublisher, LeaseLock, ProvisionOptions, Provisioner,
    ProvisionerCapabilities, ProvisioningState, WatchEvent,
};
use crate::domain::volume::{
    claim_class, claim_key, claim_provisioner, claim_reference, claim_uid, class_reclaim_policy,
    is_block_claim, is_bound, quantity_bytes, requested_storage, selected_node, volume_class,
    volume_claim_uid, volume_name_for_claim, volume_phase, volume_provisioners,
    volume_reclaim_policy, waits_for_first_consumer, ANN_PROVISIONED_BY, PHASE_RELEASED,
    RECLAIM_DELETE, RESOURCE_STORAGE,
};
use crate::error::{Error, ErrorAction, Result};
use crate::leader_election::LeaderElector;
use crate::metrics::{ProvisionMetrics, DEFAULT_SUBSYSTEM};

/// How a provisioning attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// A volume was created or queued for creation
    Provisioned { volume: String, stored: StoreOutcome },
    /// The claim's volume already exists
    AlreadyProvisioned { volume: String },
    /// The provisioner continues in the background
    InBackground,
    /// The provisioner asked to be called again later
    Reschedule,
    /// The provisioner had nothing to do
    NoChange,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`ProvisionController`].
pub struct ProvisionControllerBuilder {
    config: ControllerConfig,
    api: Arc<dyn ClusterApi>,
    provisioner: Arc<dyn Provisioner>,
    metrics: Option<ProvisionMetrics>,
    events: Option<Arc<dyn EventPublisher>>,
    informers: Option<Informers>,
    lease_lock: Option<Arc<dyn LeaseLock>>,
}

impl ProvisionControllerBuilder {
    /// Record outcomes on `metrics` instead of a fresh registry
    pub fn metrics(mut self, metrics: ProvisionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use pre-built watch streams instead of opening them from the API
    pub fn informers(mut self, informers: Informers) -> Self {
        self.informers = Some(informers);
        self
    }

    /// Lock used for leader election, required when it is configured
    pub fn lease_lock(mut self, lock: Arc<dyn LeaseLock>) -> Self {
        self.lease_lock = Some(lock);
        self
    }

    pub fn build(self) -> Result<Arc<ProvisionController>> {
        let config = self.config;
        config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => ProvisionMetrics::new(DEFAULT_SUBSYSTEM)?,
        };
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(LoggingEventPublisher::new()));

        let leader_elector = match (&config.leader_election, self.lease_lock) {
            (Some(le), Some(lock)) => Some(Arc::new(
                LeaderElector::new(lock, le.clone())?.with_event_publisher(Arc::clone(&events)),
            )),
            (Some(_), None) => {
                return Err(Error::Config(
                    "leader election is enabled but no lease lock was supplied".into(),
                ))
            }
            (None, Some(_)) => {
                warn!("Lease lock supplied without leader election config, ignoring it");
                None
            }
            (None, None) => None,
        };

        let volume_store = VolumeStoreQueue::new(
            Arc::clone(&self.api),
            Arc::clone(&self.provisioner),
            Arc::clone(&events),
            config.create_provisioned_pv_interval,
            config.create_provisioned_pv_max_delay,
            config.max_persist_retries,
        );
        let claim_queue = WorkQueue::new(
            "claims",
            config.claim_retry_base_delay,
            config.claim_retry_max_delay,
        );
        let volume_queue = WorkQueue::new(
            "volumes",
            config.claim_retry_base_delay,
            config.claim_retry_max_delay,
        );
        let capabilities = ProvisionerCapabilities::of(self.provisioner.as_ref());

        info!(
            provisioner = %config.provisioner_name,
            aliases = ?config.additional_provisioner_names,
            qualifier = capabilities.qualifier,
            block = capabilities.block,
            leader_election = leader_elector.is_some(),
            "Provision controller configured"
        );

        Ok(Arc::new(ProvisionController {
            config,
            api: self.api,
            provisioner: self.provisioner,
            capabilities,
            metrics,
            events,
            claims: ObjectCache::new(),
            volumes: ObjectCache::new(),
            classes: ObjectCache::new(),
            claims_in_progress: ClaimsInProgress::new(),
            settled_claims: DashMap::new(),
            claim_queue,
            volume_queue,
            volume_store,
            informers: Mutex::new(self.informers),
            leader_elector,
        }))
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Dynamic volume provisioning controller.
pub struct ProvisionController {
    config: ControllerConfig,
    api: Arc<dyn ClusterApi>,
    provisioner: Arc<dyn Provisioner>,
    capabilities: ProvisionerCapabilities,
    metrics: ProvisionMetrics,
    events: Arc<dyn EventPublisher>,

    claims: ObjectCache<PersistentVolumeClaim>,
    volumes: ObjectCache<PersistentVolume>,
    classes: ObjectCache<StorageClass>,

    claims_in_progress: Arc<ClaimsInProgress>,
    /// Claims whose last outcome is not retried, by uid, with the
    /// `resourceVersion` that produced it
    settled_claims: DashMap<String, Option<String>>,
    claim_queue: Arc<WorkQueue>,
    volume_queue: Arc<WorkQueue>,
    volume_store: Arc<VolumeStoreQueue>,

    informers: Mutex<Option<Informers>>,
    leader_elector: Option<Arc<LeaderElector>>,
}

impl ProvisionController {
    pub fn builder(
        config: ControllerConfig,
        api: Arc<dyn ClusterApi>,
        provisioner: Arc<dyn Provisioner>,
    ) -> ProvisionControllerBuilder {
        ProvisionControllerBuilder {
            config,
            api,
            provisioner,
            metrics: None,
            events: None,
            informers: None,
            lease_lock: None,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ProvisionMetrics {
        &self.metrics
    }

    pub fn claims_in_progress(&self) -> &ClaimsInProgress {
        &self.claims_in_progress
    }

    pub fn volume_store(&self) -> &VolumeStoreQueue {
        &self.volume_store
    }

    pub fn leader_elector(&self) -> Option<&Arc<LeaderElector>> {
        self.leader_elector.as_ref()
    }

    /// Whether this replica runs workers right now
    pub fn is_leader(&self) -> bool {
        self.leader_elector.as_ref().map_or(true, |e| e.is_leader())
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let informers = self
            .informers
            .lock()
            .take()
            .unwrap_or_else(|| Informers::from_api(self.api.as_ref()));

        info!(provisioner = %self.config.provisioner_name, "Starting provision controller");

        let watch = tokio::spawn(Arc::clone(&self).watch(informers, shutdown.clone()));
        let resync = tokio::spawn(Arc::clone(&self).resync_loop(shutdown.clone()));

        match &self.leader_elector {
            Some(elector) => {
                let this = Arc::clone(&self);
                elector
                    .run(shutdown.clone(), move |token| Arc::clone(&this).process(token))
                    .await;
            }
            None => Arc::clone(&self).process(shutdown.clone()).await,
        }

        for task in [watch, resync] {
            if let Err(e) = task.await {
                error!(error = %e, "Controller task failed");
            }
        }

        info!(
            pending_volumes = self.volume_store.len(),
            "Provision controller stopped"
        );
        Ok(())
    }

    /// Run the workers until `token` is cancelled.
    async fn process(self: Arc<Self>, token: CancellationToken) {
        info!(threadiness = self.config.threadiness, "Starting workers");

        let mut workers = JoinSet::new();
        for _ in 0..self.config.threadiness {
            workers.spawn(Arc::clone(&self).claim_worker(token.clone()));
            workers.spawn(Arc::clone(&self).volume_worker(token.clone()));
        }
        workers.spawn(Arc::clone(&self.volume_store).run(token.clone()));

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker failed");
            }
        }
        info!("Workers stopped");
    }

    // =========================================================================
    // Event Handling
    // =========================================================================

    async fn watch(self: Arc<Self>, informers: Informers, token: CancellationToken) {
        let Informers {
            mut claims,
            mut volumes,
            mut classes,
        } = informers;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(event) = classes.next() => self.on_class_event(event),
                Some(event) = claims.next() => self.on_claim_event(event),
                Some(event) = volumes.next() => self.on_volume_event(event),
                else => {
                    warn!("All watch streams ended");
                    break;
                }
            }
        }
        debug!("Watch loop stopped");
    }

    fn on_claim_event(&self, event: WatchEvent<PersistentVolumeClaim>) {
        for (uid, claim) in self.claims.apply(event) {
            match claim {
                Some(claim) => self.enqueue_claim(&uid, &claim),
                None => {
                    self.settled_claims.remove(&uid);
                    if self.claims_in_progress.remove(&uid).is_some() {
                        debug!(uid = %uid, "Claim deleted while in progress");
                    }
                }
            }
        }
    }

    fn on_class_event(&self, event: WatchEvent<StorageClass>) {
        let changed: Vec<String> = self
            .classes
            .apply(event)
            .into_iter()
            .filter_map(|(name, class)| class.map(|_| name))
            .collect();
        if changed.is_empty() {
            return;
        }
        for claim in self.claims.list() {
            let class = claim_class(&claim).unwrap_or_default();
            if changed.iter().any(|name| name == class) {
                if let Some(uid) = claim_uid(&claim) {
                    self.enqueue_claim(uid, &claim);
                }
            }
        }
    }

    fn on_volume_event(&self, event: WatchEvent<PersistentVolume>) {
        for (name, volume) in self.volumes.apply(event) {
            let Some(volume) = volume else {
                continue;
            };

            // a volume for a claim provisioned in the background completes it
            if let Some(uid) = volume_claim_uid(&volume) {
                if self.claims_in_progress.remove(uid).is_some() {
                    debug!(uid = %uid, volume = %name, "Claim no longer in progress");
                }
            }

            if self.should_delete(&volume) {
                self.volume_queue.add(name);
            }
        }
    }

    fn enqueue_claim(&self, uid: &str, claim: &PersistentVolumeClaim) {
        if !self.is_settled(uid, claim) && self.should_provision(claim) {
            self.claim_queue.add(uid);
        }
    }

    /// Whether `claim` ended in an outcome that is never retried and has not
    /// changed since. A newer `resourceVersion` forgets the outcome.
    fn is_settled(&self, uid: &str, claim: &PersistentVolumeClaim) -> bool {
        let version = claim.metadata.resource_version.as_deref();
        let changed = match self.settled_claims.get(uid) {
            Some(settled) => settled.value().as_deref() != version,
            None => return false,
        };
        if changed {
            self.settled_claims.remove(uid);
        }
        !changed
    }

    fn settle(&self, uid: &str, claim: &PersistentVolumeClaim) {
        self.settled_claims
            .insert(uid.to_string(), claim.metadata.resource_version.clone());
    }

    async fn resync_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resync_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.resync(),
            }
        }
    }

    /// Re-evaluate every cached claim and volume
    fn resync(&self) {
        for claim in self.claims.list() {
            if let Some(uid) = claim_uid(&claim) {
                self.enqueue_claim(uid, &claim);
            }
        }
        for volume in self.volumes.list() {
            if self.should_delete(&volume) {
                if let Some(name) = volume.metadata.name.as_deref() {
                    self.volume_queue.add(name);
                }
            }
        }
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Whether this controller should provision `claim`
    pub fn should_provision(&self, claim: &PersistentVolumeClaim) -> bool {
        if is_bound(claim) || claim_uid(claim).is_none() {
            return false;
        }

        if let Some(requested) = claim_provisioner(claim) {
            if !self.config.is_known_provisioner(requested) {
                return false;
            }
        }

        let Some(class) = claim_class(claim).and_then(|name| self.classes.get(name)) else {
            return false;
        };
        if !self.config.is_known_provisioner(&class.provisioner) {
            return false;
        }

        if self.capabilities.qualifier {
            if let Some(qualifier) = self.provisioner.qualifier() {
                if !qualifier.should_provision(claim) {
                    return false;
                }
            }
        }

        if waits_for_first_consumer(&class) && selected_node(claim).is_none() {
            return false;
        }

        true
    }

    async fn claim_worker(self: Arc<Self>, token: CancellationToken) {
        loop {
            let uid = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                uid = self.claim_queue.get() => uid,
            };
            self.sync_claim(&uid).await;
            self.claim_queue.done(&uid);
        }
    }

    async fn sync_claim(&self, uid: &str) {
        let Some(claim) = self.claims.get(uid) else {
            self.claim_queue.forget(uid);
            return;
        };
        if self.is_settled(uid, &claim) || !self.should_provision(&claim) {
            self.claim_queue.forget(uid);
            return;
        }
        let Some(guard) = self.claims_in_progress.try_acquire(uid, Arc::clone(&claim)) else {
            debug!(claim = %claim_key(&claim), "Claim already in progress");
            return;
        };

        let result = self.provision_claim_operation(&claim).await;
        self.handle_provision_result(&claim, guard, result).await;
    }

    /// Provision a volume for `claim` and hand it to the volume store
    #[instrument(skip(self, claim), fields(claim = %claim_key(claim)))]
    pub async fn provision_claim_operation(
        &self,
        claim: &PersistentVolumeClaim,
    ) -> Result<ProvisionOutcome> {
        let uid = claim_uid(claim).ok_or_else(|| Error::Internal("claim has no uid".into()))?;
        let volume_name = volume_name_for_claim(uid);

        if self.volume_exists(&volume_name).await? {
            debug!(volume = %volume_name, "Volume already exists");
            return Ok(ProvisionOutcome::AlreadyProvisioned {
                volume: volume_name,
            });
        }

        let class_name = claim_class(claim).unwrap_or_default();
        let class = self
            .classes
            .get(class_name)
            .ok_or_else(|| Error::StorageClassNotFound(class_name.to_string()))?;

        if is_block_claim(claim) && !self.capabilities.block {
            return Err(Error::BlockUnsupported {
                provisioner: self.config.provisioner_name.clone(),
            });
        }

        let options = ProvisionOptions {
            volume_name: volume_name.clone(),
            claim: claim.clone(),
            storage_class: (*class).clone(),
            selected_node: selected_node(claim).map(String::from),
            allowed_topologies: class.allowed_topologies.clone().unwrap_or_default(),
        };

        info!(volume = %volume_name, class = %class_name, "Provisioning volume");
        match self.provisioner.provision(options).await? {
            ProvisioningState::Finished(volume) => {
                let volume = self.finalize_volume(*volume, &volume_name, claim, &class)?;
                let name = volume.metadata.name.clone().unwrap_or(volume_name);
                let stored = self.volume_store.store_volume(volume).await?;
                Ok(ProvisionOutcome::Provisioned {
                    volume: name,
                    stored,
                })
            }
            ProvisioningState::InBackground => Ok(ProvisionOutcome::InBackground),
            ProvisioningState::Reschedule => Ok(ProvisionOutcome::Reschedule),
            ProvisioningState::NoChange => Ok(ProvisionOutcome::NoChange),
        }
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        if self.volumes.contains(name) || self.volume_store.contains(name) {
            return Ok(true);
        }
        Ok(self.api.get_volume(name).await?.is_some())
    }

    /// Tie a provisioned volume to its claim and class.
    ///
    /// Fails when the plug-in reports a capacity smaller than requested.
    fn finalize_volume(
        &self,
        mut volume: PersistentVolume,
        volume_name: &str,
        claim: &PersistentVolumeClaim,
        class: &StorageClass,
    ) -> Result<PersistentVolume> {
        volume
            .metadata
            .name
            .get_or_insert_with(|| volume_name.to_string());
        volume
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                ANN_PROVISIONED_BY.to_string(),
                self.config.provisioner_name.clone(),
            );

        let claim_spec = claim.spec.as_ref();
        let spec = volume.spec.get_or_insert_with(Default::default);
        spec.claim_ref = Some(claim_reference(claim));
        spec.storage_class_name = class.metadata.name.clone();
        spec.persistent_volume_reclaim_policy = Some(class_reclaim_policy(class).to_string());
        if spec.access_modes.is_none() {
            spec.access_modes = claim_spec.and_then(|s| s.access_modes.clone());
        }
        if spec.volume_mode.is_none() {
            spec.volume_mode = claim_spec.and_then(|s| s.volume_mode.clone());
        }
        let requested = requested_storage(claim);
        match spec.capacity.as_ref().and_then(|c| c.get(RESOURCE_STORAGE)) {
            Some(actual) => {
                let too_small = requested
                    .and_then(quantity_bytes)
                    .zip(quantity_bytes(actual))
                    .is_some_and(|(want, got)| got < want);
                if too_small {
                    return Err(Error::Provisioning(format!(
                        "volume {} has capacity {}, claim requested {}",
                        volume_name,
                        actual.0,
                        requested.map(|q| q.0.as_str()).unwrap_or_default()
                    )));
                }
            }
            None => {
                if let Some(q) = requested {
                    spec.capacity
                        .get_or_insert_with(BTreeMap::new)
                        .insert(RESOURCE_STORAGE.to_string(), q.clone());
                }
            }
        }
        Ok(volume)
    }

    async fn handle_provision_result(
        &self,
        claim: &PersistentVolumeClaim,
        guard: InProgressGuard,
        result: Result<ProvisionOutcome>,
    ) {
        let uid = guard.uid().to_string();
        let key = claim_key(claim);
        let class = claim_class(claim).unwrap_or_default().to_string();

        match result {
            Ok(ProvisionOutcome::Provisioned { volume, stored }) => {
                info!(claim = %key, volume = %volume, stored = ?stored, "Volume provisioned");
                self.metrics.record_provision_success(&class);
                self.publish(DomainEvent::provisioning_succeeded(&key, &volume, &class))
                    .await;
                self.claim_queue.forget(&uid);
            }
            Ok(ProvisionOutcome::AlreadyProvisioned { .. }) | Ok(ProvisionOutcome::NoChange) => {
                self.claim_queue.forget(&uid);
            }
            Ok(ProvisionOutcome::InBackground) => {
                info!(claim = %key, "Provisioning continues in the background");
                guard.retain();
                self.publish(DomainEvent::provisioning_in_background(&key))
                    .await;
                self.claim_queue.forget(&uid);
            }
            Ok(ProvisionOutcome::Reschedule) => {
                debug!(claim = %key, "Provisioning rescheduled");
                self.claim_queue.add_rate_limited(uid);
            }
            Err(e) => match e.action() {
                ErrorAction::Ignore => {
                    debug!(claim = %key, reason = %e, "Claim ignored by provisioner");
                    self.settle(&uid, claim);
                    self.claim_queue.forget(&uid);
                }
                ErrorAction::NoRequeue => {
                    warn!(claim = %key, error = %e, "Provisioning failed permanently");
                    self.settle(&uid, claim);
                    self.metrics.record_provision_failure(&class);
                    self.publish(DomainEvent::provisioning_failed(
                        &key,
                        &class,
                        e.to_string(),
                        false,
                    ))
                    .await;
                    self.claim_queue.forget(&uid);
                }
                ErrorAction::RequeueWithBackoff => {
                    self.metrics.record_provision_failure(&class);
                    let failures = self.claim_queue.num_requeues(&uid) + 1;
                    let threshold = self.config.failed_provision_threshold;
                    let will_retry = threshold == 0 || failures < threshold;
                    if will_retry {
                        warn!(claim = %key, error = %e, failures, "Provisioning failed, retrying");
                        self.claim_queue.add_rate_limited(uid.as_str());
                    } else {
                        error!(claim = %key, error = %e, failures, "Provisioning failed, giving up");
                        self.claim_queue.forget(&uid);
                    }
                    self.publish(DomainEvent::provisioning_failed(
                        &key,
                        &class,
                        e.to_string(),
                        will_retry,
                    ))
                    .await;
                }
            },
        }
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Whether this controller should delete `volume`
    pub fn should_delete(&self, volume: &PersistentVolume) -> bool {
        if volume.metadata.deletion_timestamp.is_some() {
            return false;
        }
        if volume_phase(volume) != Some(PHASE_RELEASED) {
            return false;
        }
        if volume_reclaim_policy(volume) != Some(RECLAIM_DELETE) {
            return false;
        }
        volume_provisioners(volume)
            .next()
            .is_some_and(|p| self.config.is_known_provisioner(p))
    }

    async fn volume_worker(self: Arc<Self>, token: CancellationToken) {
        loop {
            let name = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                name = self.volume_queue.get() => name,
            };
            self.sync_volume(&name).await;
            self.volume_queue.done(&name);
        }
    }

    async fn sync_volume(&self, name: &str) {
        let Some(volume) = self.volumes.get(name) else {
            self.volume_queue.forget(name);
            return;
        };
        if !self.should_delete(&volume) {
            self.volume_queue.forget(name);
            return;
        }

        let class = volume_class(&volume).to_string();
        match self.delete_volume_operation(&volume).await {
            Ok(()) => {
                info!(volume = %name, "Volume deleted");
                self.metrics.record_delete_success(&class);
                self.publish(DomainEvent::volume_deleted(name, &class)).await;
                self.volume_queue.forget(name);
            }
            Err(e) if e.is_ignored() => {
                debug!(volume = %name, reason = %e, "Volume ignored by provisioner");
                self.volume_queue.forget(name);
            }
            Err(e) => {
                self.metrics.record_delete_failure(&class);
                self.publish(DomainEvent::volume_delete_failed(name, &class, e.to_string()))
                    .await;
                let failures = self.volume_queue.num_requeues(name) + 1;
                let threshold = self.config.failed_delete_threshold;
                if e.is_retryable() && (threshold == 0 || failures < threshold) {
                    warn!(volume = %name, error = %e, failures, "Volume deletion failed, retrying");
                    self.volume_queue.add_rate_limited(name);
                } else {
                    error!(volume = %name, error = %e, failures, "Volume deletion failed, giving up");
                    self.volume_queue.forget(name);
                }
            }
        }
    }

    /// Release the backing storage, then remove the volume object
    #[instrument(skip(self, volume), fields(volume = ?volume.metadata.name))]
    pub async fn delete_volume_operation(&self, volume: &PersistentVolume) -> Result<()> {
        let name = volume
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::Internal("volume has no name".into()))?;

        self.provisioner.delete(volume).await?;

        match self.api.delete_volume(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

impl std::fmt::Debug for ProvisionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionController")
            .field("provisioner", &self.config.provisioner_name)
            .field("capabilities", &self.capabilities)
            .field("claims_in_progress", &self.claims_in_progress.len())
            .field("pending_volumes", &self.volume_store.len())
            .finish()
    }
}
