//! Leader election over a compare-and-swap lease
//!
//! Only the replica holding the lease runs the provisioning workers. The
//! lease is read, checked and written back with its version, so if it
//! changed between read and write the write is rejected and nobody gains
//! leadership by accident.
//!
//! ```text
//!            acquire ok
//!  Candidate ───────────▶ Leader
//!      ▲                    │ lease taken, renew deadline passed,
//!      └────────────────────┘ or shutdown (lease released)
//! ```
//!
//! The work handed to [`LeaderElector::run`] receives a `CancellationToken`
//! that is cancelled the moment leadership is lost; the elector waits for it
//! to return before campaigning again.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::LoggingEventPublisher;
use crate::config::LeaderElectionConfig;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, LeaseLock, LeaseRecord};
use crate::error::Result;

/// Role of this replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Candidate,
    Leader,
}

/// Campaigns for a lease and runs work while holding it.
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    config: LeaderElectionConfig,
    events: Arc<dyn EventPublisher>,
    state: watch::Sender<LeaderState>,
}

impl LeaderElector {
    pub fn new(lock: Arc<dyn LeaseLock>, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(LeaderState::Candidate);
        Ok(Self {
            lock,
            config,
            events: Arc::new(LoggingEventPublisher::new()),
            state,
        })
    }

    /// Publish leadership changes through `events`
    pub fn with_event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    pub fn config(&self) -> &LeaderElectionConfig {
        &self.config
    }

    /// Current role
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Observe role changes
    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    /// Campaign until `shutdown`, running `lead` whenever this replica leads.
    ///
    /// Lease API failures are logged and retried. On shutdown a held lease
    /// is released so another replica can take over without waiting for it
    /// to expire.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, lead: F)
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(
            identity = %self.config.identity,
            lease = %self.lock.describe(),
            "Waiting for leadership"
        );

        loop {
            if !self.campaign(&shutdown).await {
                break;
            }

            self.set_state(LeaderState::Leader);
            info!(identity = %self.config.identity, "Leadership acquired");
            self.publish(DomainEvent::leadership_acquired(
                &self.config.identity,
                self.lock.describe(),
            ))
            .await;

            let token = shutdown.child_token();
            let work = async {
                lead(token.clone()).await;
                token.cancel();
            };
            let ((), lost) = tokio::join!(work, self.hold(&token));

            self.set_state(LeaderState::Candidate);
            self.publish(DomainEvent::leadership_lost(
                &self.config.identity,
                self.lock.describe(),
            ))
            .await;

            if shutdown.is_cancelled() {
                break;
            }
            if lost {
                warn!(identity = %self.config.identity, "Leadership lost, standing by as candidate");
            }
        }

        if let Err(e) = self.release().await {
            warn!(identity = %self.config.identity, error = %e, "Failed to release lease");
        }
        debug!(identity = %self.config.identity, "Leader election stopped");
    }

    /// Retry acquisition every retry period. Returns `false` on shutdown.
    async fn campaign(&self, shutdown: &CancellationToken) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(identity = %self.config.identity, "Lease held by another replica");
                }
                Err(e) => {
                    warn!(
                        identity = %self.config.identity,
                        error = %e,
                        retry_ms = self.config.retry_period.as_millis() as u64,
                        "Failed to acquire lease, retrying"
                    );
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Renew until `token` is cancelled or leadership is lost.
    /// Returns `true` if leadership was lost.
    async fn hold(&self, token: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = token.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }

            let attempt =
                tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    continue;
                }
                Ok(Ok(false)) => {
                    warn!(identity = %self.config.identity, "Lease taken by another replica");
                    token.cancel();
                    return true;
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.config.identity, error = %e, "Failed to renew lease");
                }
                Err(_) => {
                    warn!(identity = %self.config.identity, "Lease renewal timed out");
                }
            }

            if last_renewal.elapsed() >= self.config.renew_deadline {
                warn!(
                    identity = %self.config.identity,
                    deadline_ms = self.config.renew_deadline.as_millis() as u64,
                    "Renew deadline exceeded"
                );
                token.cancel();
                return true;
            }
        }
    }

    /// Acquire, renew or take over the lease in one compare-and-swap step
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let identity = self.config.identity.as_str();

        let Some(current) = self.lock.get().await? else {
            let record = LeaseRecord::acquired(identity, self.config.lease_duration, now);
            let created = self.lock.create(&record).await?;
            if created {
                info!(identity, "Created lease");
            }
            return Ok(created);
        };

        if current.is_held_by(identity) {
            let renewed = LeaseRecord {
                renew_time: Some(now),
                lease_duration: self.config.lease_duration,
                ..current
            };
            return self.lock.update(&renewed).await;
        }

        if !current.is_expired(now) {
            return Ok(false);
        }

        let transitions = current.lease_transitions + 1;
        let record = LeaseRecord {
            lease_transitions: transitions,
            version: current.version,
            ..LeaseRecord::acquired(identity, self.config.lease_duration, now)
        };
        let taken = self.lock.update(&record).await?;
        if taken {
            info!(identity, transitions, "Took over expired lease");
        }
        Ok(taken)
    }

    /// Clear the holder and back-date the renew time if we hold the lease
    pub async fn release(&self) -> Result<()> {
        let Some(current) = self.lock.get().await? else {
            return Ok(());
        };
        if !current.is_held_by(&self.config.identity) {
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let released = LeaseRecord {
            holder_identity: None,
            renew_time: Some(past),
            ..current
        };
        if self.lock.update(&released).await? {
            info!(identity = %self.config.identity, "Lease released");
        }
        Ok(())
    }

    fn set_state(&self, state: LeaderState) {
        self.state.send_replace(state);
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("identity", &self.config.identity)
            .field("lease", &self.lock.describe())
            .field("state", &self.state())
            .finish()
    }
}
