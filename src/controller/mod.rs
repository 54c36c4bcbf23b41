//! Controller module
//!
//! The provisioning reconciler and the machinery it runs on: work queues
//! with per-key backoff, watch-fed caches, the in-progress claim set and
//! the volume store retry queue.

mod in_progress;
mod informer;
mod provision;
mod volume_store;
mod workqueue;

pub use in_progress::{ClaimsInProgress, InProgressGuard};
pub use informer::{CacheKey, Change, Informers, ObjectCache};
pub use provision::{ProvisionController, ProvisionControllerBuilder, ProvisionOutcome};
pub use volume_store::{StoreOutcome, VolumeStoreQueue};
pub use workqueue::{ExponentialRateLimiter, WorkQueue};
