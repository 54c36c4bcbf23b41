//! Claims in progress
//!
//! Tracks claims whose provisioning has started, keyed by claim uid, so the
//! same claim is never handed to the plug-in twice concurrently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;

struct InProgress {
    /// Identifies the attempt that inserted the entry
    attempt: u64,
    claim: Arc<PersistentVolumeClaim>,
}

/// Concurrent set of claims being provisioned.
#[derive(Default)]
pub struct ClaimsInProgress {
    claims: DashMap<String, InProgress>,
    attempts: AtomicU64,
}

impl ClaimsInProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a claim as in progress.
    ///
    /// Returns `None` if the uid is already tracked. The entry is removed
    /// when the guard drops unless [`InProgressGuard::retain`] was called.
    /// A guard only ever removes the entry it inserted.
    pub fn try_acquire(
        self: &Arc<Self>,
        uid: &str,
        claim: Arc<PersistentVolumeClaim>,
    ) -> Option<InProgressGuard> {
        match self.claims.entry(uid.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(v) => {
                let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                v.insert(InProgress { attempt, claim });
                Some(InProgressGuard {
                    owner: Arc::clone(self),
                    uid: uid.to_string(),
                    attempt,
                    retained: false,
                })
            }
        }
    }

    /// Stop tracking a claim, returning it if it was tracked
    pub fn remove(&self, uid: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims.remove(uid).map(|(_, entry)| entry.claim)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.claims.contains_key(uid)
    }

    pub fn get(&self, uid: &str) -> Option<Arc<PersistentVolumeClaim>> {
        self.claims.get(uid).map(|e| Arc::clone(&e.claim))
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.claims.iter().map(|e| e.key().clone()).collect()
    }
}

impl std::fmt::Debug for ClaimsInProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimsInProgress")
            .field("claims", &self.keys())
            .finish()
    }
}

/// Releases an in-progress entry on drop.
#[derive(Debug)]
pub struct InProgressGuard {
    owner: Arc<ClaimsInProgress>,
    uid: String,
    attempt: u64,
    retained: bool,
}

impl InProgressGuard {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Keep the entry after the guard is dropped.
    ///
    /// Used when the plug-in continues in the background; the entry is
    /// released once the resulting volume is observed.
    pub fn retain(mut self) {
        self.retained = true;
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        if !self.retained {
            self.owner
                .claims
                .remove_if(&self.uid, |_, entry| entry.attempt == self.attempt);
        }
    }
}
