//! Rate-limited work queue
//!
//! Keys are deduplicated while waiting, and a key that is being processed is
//! never handed to a second worker: re-adding it marks it dirty and it is
//! queued again once `done` is called.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

// =============================================================================
// Rate Limiter
// =============================================================================

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ExponentialRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay before the next attempt of `key`, counting this attempt as a failure
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        match 2u32.checked_pow(exponent) {
            Some(factor) => self.base.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.failures.lock().remove(key);
    }

    /// Number of failures recorded for `key` since the last `forget`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

// =============================================================================
// Work Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
}

/// Deduplicating FIFO of keys with per-key rate limiting.
#[derive(Debug)]
pub struct WorkQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: ExponentialRateLimiter,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, base_delay: Duration, max_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            limiter: ExponentialRateLimiter::new(base_delay, max_delay),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        {
            let mut state = self.state.lock();
            if !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                trace!(queue = %self.name, key = %key, "Key busy, deferred until done");
                return;
            }
            state.queue.push_back(key);
        }
        self.notify.notify_one();
    }

    /// Wait for the next key and mark it as processing.
    ///
    /// Cancel safe: nothing is dequeued until the key is returned.
    pub async fn get(&self) -> String {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return key;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Finish processing `key`, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeue {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after its current backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = self.limiter.when(&key);
        trace!(queue = %self.name, key = %key, delay_ms = delay.as_millis() as u64, "Rate limited requeue");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Number of keys waiting
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
