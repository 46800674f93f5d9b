//! In-memory coordination backends.
//!
//! Used by single-process deployments and tests. Both types expose fault
//! injection so failure paths can be exercised deterministically.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    AcquireOutcome, CoordinationError, LeaseBackend, LeaseOwner, Operation, ReleaseOutcome,
    Transaction, Version, Versioned, VersionedStore,
};

/// Versioned key-value store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Versioned<Vec<u8>>>>,
    fail_commits_touching: Mutex<HashSet<String>>,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit that writes `key` fail with a backend error.
    pub fn fail_next_commit_touching(&self, key: impl Into<String>) {
        self.fail_commits_touching
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into());
    }

    /// Overwrites a key outside any transaction, bumping its version.
    pub fn write_unchecked(&self, key: &str, value: Vec<u8>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let version = entries.get(key).map_or(1, |e| e.version + 1);
        entries.insert(key.to_string(), Versioned { value, version });
    }

    /// Number of successful commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>, CoordinationError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoordinationError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn commit(&self, transaction: Transaction) -> Result<(), CoordinationError> {
        {
            let mut failing = self
                .fail_commits_touching
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = transaction
                .operations()
                .iter()
                .map(Operation::key)
                .find(|key| failing.contains(*key))
                .map(str::to_string)
            {
                failing.remove(&key);
                return Err(CoordinationError::Backend(format!(
                    "injected commit failure on '{key}'"
                )));
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        // Later operations see the versions left by earlier ones.
        let mut staged: HashMap<&str, Option<Version>> = HashMap::new();
        for operation in transaction.operations() {
            let current = match staged.get(operation.key()) {
                Some(version) => *version,
                None => entries.get(operation.key()).map(|e| e.version),
            };
            if !operation.expected().matches(current) {
                return Err(CoordinationError::Conflict {
                    key: operation.key().to_string(),
                    expected: operation.expected().to_string(),
                    actual: current.map_or_else(|| "absent".to_string(), |v| format!("version {v}")),
                });
            }
            let next = match operation {
                Operation::Put { .. } => Some(current.map_or(1, |v| v + 1)),
                Operation::Delete { .. } => None,
            };
            staged.insert(operation.key(), next);
        }

        for operation in transaction.into_operations() {
            match operation {
                Operation::Put { key, value, .. } => {
                    let version = entries.get(&key).map_or(1, |e| e.version + 1);
                    entries.insert(key, Versioned { value, version });
                }
                Operation::Delete { key, .. } => {
                    entries.remove(&key);
                }
            }
        }

        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Lease {
    owner: LeaseOwner,
    expires_at: Option<Instant>,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Lease table held in process memory.
///
/// Leases never expire unless a TTL is configured; [`MemoryLeases::expire_session`]
/// simulates the coordination session being lost.
#[derive(Debug, Default)]
pub struct MemoryLeases {
    leases: Mutex<HashMap<String, Lease>>,
    ttl: Option<Duration>,
    fail_releases: AtomicBool,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases expire `ttl` after being taken.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Makes subsequent releases fail until reset.
    pub fn set_release_failure(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::Relaxed);
    }

    /// Drops every lease, as if the coordination session expired.
    pub fn expire_session(&self) {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Current owner of a lease, if any.
    pub fn owner(&self, name: &str) -> Option<LeaseOwner> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.get(name).map(|l| l.owner.clone())
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeases {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &LeaseOwner,
    ) -> Result<AcquireOutcome, CoordinationError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = Lease {
            owner: owner.clone(),
            expires_at: self.ttl.map(|ttl| now + ttl),
        };

        match leases.get(name) {
            None => {
                leases.insert(name.to_string(), fresh);
                Ok(AcquireOutcome::Acquired)
            }
            Some(lease) if lease.is_expired(now) => {
                debug!(lock = name, previous = %lease.owner, "Taking over expired lease");
                leases.insert(name.to_string(), fresh);
                Ok(AcquireOutcome::AcquiredExpired)
            }
            Some(_) => Ok(AcquireOutcome::Held),
        }
    }

    fn release(&self, name: &str, owner: &LeaseOwner) -> Result<ReleaseOutcome, CoordinationError> {
        if self.fail_releases.load(Ordering::Relaxed) {
            return Err(CoordinationError::Backend(format!(
                "injected release failure on '{name}'"
            )));
        }

        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get(name) {
            None => Ok(ReleaseOutcome::NotHeld),
            Some(lease) if lease.owner != *owner => Ok(ReleaseOutcome::HeldByOther),
            Some(_) => {
                leases.remove(name);
                Ok(ReleaseOutcome::Released)
            }
        }
    }
}
