//! Lock attempt statistics.
//!
//! One [`LockStats`] registry is created per process and shared by every
//! [`crate::LockManager`]. Counters only grow; tests start from a fresh
//! registry or call [`LockStats::reset`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// The outcome being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCounter {
    /// An acquisition was attempted.
    Acquire,
    /// The attempt failed for a reason other than a timeout.
    AcquireFailed,
    /// The attempt timed out.
    AcquireTimedOut,
    /// The attempt succeeded.
    Locked,
    /// The lease was released.
    Release,
    /// The backend failed to release the lease.
    ReleaseFailed,
    /// The holder tried to take a lock it already holds.
    Reentry,
    /// Waiting would have closed a wait-for cycle.
    Deadlock,
    /// Released a lease that did not exist.
    NakedRelease,
    /// Took over a lease its previous owner never released.
    AcquireWithoutRelease,
    /// Released a lease that belonged to someone else.
    ForeignRelease,
}

/// Atomic counters for one lock name.
#[derive(Debug, Default)]
pub struct LockCounters {
    acquire: AtomicU64,
    acquire_failed: AtomicU64,
    acquire_timed_out: AtomicU64,
    locked: AtomicU64,
    release: AtomicU64,
    release_failed: AtomicU64,
    reentry: AtomicU64,
    deadlock: AtomicU64,
    naked_release: AtomicU64,
    acquire_without_release: AtomicU64,
    foreign_release: AtomicU64,
}

impl LockCounters {
    pub fn record(&self, counter: LockCounter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
    }

    fn counter(&self, counter: LockCounter) -> &AtomicU64 {
        match counter {
            LockCounter::Acquire => &self.acquire,
            LockCounter::AcquireFailed => &self.acquire_failed,
            LockCounter::AcquireTimedOut => &self.acquire_timed_out,
            LockCounter::Locked => &self.locked,
            LockCounter::Release => &self.release,
            LockCounter::ReleaseFailed => &self.release_failed,
            LockCounter::Reentry => &self.reentry,
            LockCounter::Deadlock => &self.deadlock,
            LockCounter::NakedRelease => &self.naked_release,
            LockCounter::AcquireWithoutRelease => &self.acquire_without_release,
            LockCounter::ForeignRelease => &self.foreign_release,
        }
    }

    pub fn snapshot(&self) -> LockMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        LockMetrics {
            acquire: load(&self.acquire),
            acquire_failed: load(&self.acquire_failed),
            acquire_timed_out: load(&self.acquire_timed_out),
            locked: load(&self.locked),
            release: load(&self.release),
            release_failed: load(&self.release_failed),
            reentry: load(&self.reentry),
            deadlock: load(&self.deadlock),
            naked_release: load(&self.naked_release),
            acquire_without_release: load(&self.acquire_without_release),
            foreign_release: load(&self.foreign_release),
        }
    }
}

/// Point-in-time copy of [`LockCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetrics {
    pub acquire: u64,
    pub acquire_failed: u64,
    pub acquire_timed_out: u64,
    pub locked: u64,
    pub release: u64,
    pub release_failed: u64,
    pub reentry: u64,
    pub deadlock: u64,
    pub naked_release: u64,
    pub acquire_without_release: u64,
    pub foreign_release: u64,
}

impl LockMetrics {
    /// Every attempt ended in exactly one of locked, failed or timed out.
    pub fn attempts_balanced(&self) -> bool {
        self.acquire == self.acquire_failed + self.acquire_timed_out + self.locked
    }

    /// Sum of all release outcomes.
    pub fn releases(&self) -> u64 {
        self.release + self.release_failed + self.naked_release + self.foreign_release
    }

    /// Counter values under their metric names.
    pub fn named(&self) -> [(&'static str, u64); 11] {
        [
            ("lockAttempt.acquire", self.acquire),
            ("lockAttempt.acquireFailed", self.acquire_failed),
            ("lockAttempt.acquireTimedOut", self.acquire_timed_out),
            ("lockAttempt.locked", self.locked),
            ("lockAttempt.release", self.release),
            ("lockAttempt.releaseFailed", self.release_failed),
            ("lockAttempt.reentry", self.reentry),
            ("lockAttempt.deadlock", self.deadlock),
            ("lockAttempt.nakedRelease", self.naked_release),
            ("lockAttempt.acquireWithoutRelease", self.acquire_without_release),
            ("lockAttempt.foreignRelease", self.foreign_release),
        ]
    }
}

impl std::ops::Add for LockMetrics {
    type Output = LockMetrics;

    fn add(self, other: LockMetrics) -> LockMetrics {
        LockMetrics {
            acquire: self.acquire + other.acquire,
            acquire_failed: self.acquire_failed + other.acquire_failed,
            acquire_timed_out: self.acquire_timed_out + other.acquire_timed_out,
            locked: self.locked + other.locked,
            release: self.release + other.release,
            release_failed: self.release_failed + other.release_failed,
            reentry: self.reentry + other.reentry,
            deadlock: self.deadlock + other.deadlock,
            naked_release: self.naked_release + other.naked_release,
            acquire_without_release: self.acquire_without_release
                + other.acquire_without_release,
            foreign_release: self.foreign_release + other.foreign_release,
        }
    }
}

/// Registry of counters keyed by lock name.
#[derive(Debug, Default)]
pub struct LockStats {
    locks: Mutex<BTreeMap<String, Arc<LockCounters>>>,
}

impl LockStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counters for `name`, created on first use.
    pub fn counters(&self, name: &str) -> Arc<LockCounters> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Metrics for one lock; all zero if it was never used.
    pub fn get(&self, name: &str) -> LockMetrics {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(name).map(|c| c.snapshot()).unwrap_or_default()
    }

    /// Metrics for every lock seen so far.
    pub fn snapshot(&self) -> BTreeMap<String, LockMetrics> {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .iter()
            .map(|(name, counters)| (name.clone(), counters.snapshot()))
            .collect()
    }

    /// Metrics summed over all locks.
    pub fn total(&self) -> LockMetrics {
        self.snapshot()
            .into_values()
            .fold(LockMetrics::default(), |acc, m| acc + m)
    }

    /// Forgets every counter. Handed-out [`LockCounters`] keep counting
    /// but are no longer reachable from this registry.
    pub fn reset(&self) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
