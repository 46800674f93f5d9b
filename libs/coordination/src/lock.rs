//! Named mutual exclusion with timeout, reentry and deadlock detection.
//!
//! Locks are scoped to logical partitions (a tenant, the pool of
//! unallocated nodes, a node type) so unrelated partitions never contend.
//! Every attempt and every release is recorded in [`LockStats`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use fleet_id::TenantName;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    AcquireOutcome, HolderId, LeaseBackend, LeaseOwner, LockCounter, LockCounters, LockError,
    LockStats, ReleaseOutcome,
};

/// Path of a lock in the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockName(String);

impl LockName {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Guards nodes that have no owning application.
    pub fn unallocated() -> Self {
        Self::new("/provision/v1/locks/unallocatedLock")
    }

    /// Guards everything owned by one tenant.
    pub fn tenant(tenant: &TenantName) -> Self {
        Self::new(format!("/config/v2/locks/{tenant}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock manager tuning.
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Delay between acquisition attempts while the lease is held elsewhere.
    pub poll_interval: Duration,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Who holds and who waits for which lock in this process.
#[derive(Debug, Default)]
struct LocalState {
    held: HashMap<LockName, HolderId>,
    waiting: HashMap<HolderId, LockName>,
}

impl LocalState {
    /// Follows holder -> awaited lock -> holder edges from `name`, returning
    /// the chain if it leads back to `me`.
    fn wait_cycle(&self, name: &LockName, me: HolderId) -> Option<Vec<String>> {
        let mut chain = vec![name.to_string()];
        let mut next = name;
        for _ in 0..=self.waiting.len() {
            let holder = self.held.get(next)?;
            if *holder == me {
                return Some(chain);
            }
            next = self.waiting.get(holder)?;
            chain.push(next.to_string());
        }
        None
    }
}

/// Removes the waiting marker even if the acquiring future is dropped.
struct WaitRegistration<'a> {
    local: &'a Mutex<LocalState>,
    holder: HolderId,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        self.local
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiting
            .remove(&self.holder);
    }
}

/// Acquires named leases from the coordination service.
pub struct LockManager {
    backend: Arc<dyn LeaseBackend>,
    stats: Arc<LockStats>,
    session: Uuid,
    config: LockManagerConfig,
    local: Arc<Mutex<LocalState>>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LeaseBackend>, stats: Arc<LockStats>) -> Self {
        Self::with_config(backend, stats, LockManagerConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn LeaseBackend>,
        stats: Arc<LockStats>,
        config: LockManagerConfig,
    ) -> Self {
        Self {
            backend,
            stats,
            session: Uuid::new_v4(),
            config,
            local: Arc::new(Mutex::new(LocalState::default())),
        }
    }

    pub fn stats(&self) -> &Arc<LockStats> {
        &self.stats
    }

    /// Acquires `name`, waiting at most `timeout`.
    ///
    /// Fails with [`LockError::Deadlock`] if the current task already holds
    /// the lock or if waiting would close a wait-for cycle, and with
    /// [`LockError::Timeout`] if the lease stays held elsewhere.
    pub async fn acquire(&self, name: &LockName, timeout: Duration) -> Result<ScopedLock, LockError> {
        let counters = self.stats.counters(name.as_str());
        counters.record(LockCounter::Acquire);
        let holder = HolderId::current();

        {
            let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
            if local.held.get(name) == Some(&holder) {
                counters.record(LockCounter::Reentry);
                counters.record(LockCounter::AcquireFailed);
                return Err(LockError::Deadlock {
                    name: name.to_string(),
                    reason: format!("already held by {holder}"),
                });
            }
            if let Some(chain) = local.wait_cycle(name, holder) {
                counters.record(LockCounter::Deadlock);
                counters.record(LockCounter::AcquireFailed);
                return Err(LockError::Deadlock {
                    name: name.to_string(),
                    reason: format!("wait-for cycle through {}", chain.join(" -> ")),
                });
            }
            local.waiting.insert(holder, name.clone());
        }

        let registration = WaitRegistration {
            local: &self.local,
            holder,
        };
        let owner = LeaseOwner {
            session: self.session,
            holder,
        };
        let outcome = self.wait_for_lease(name, &owner, timeout).await;
        drop(registration);

        match outcome {
            Ok(outcome) => {
                if outcome == AcquireOutcome::AcquiredExpired {
                    counters.record(LockCounter::AcquireWithoutRelease);
                }
                counters.record(LockCounter::Locked);
                self.local
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .held
                    .insert(name.clone(), holder);
                debug!(lock = %name, holder = %holder, "Lock acquired");
                Ok(ScopedLock {
                    name: name.clone(),
                    owner,
                    backend: Arc::clone(&self.backend),
                    counters,
                    local: Arc::clone(&self.local),
                    acquired_at: Instant::now(),
                })
            }
            Err(e @ LockError::Timeout { .. }) => {
                counters.record(LockCounter::AcquireTimedOut);
                Err(e)
            }
            Err(e) => {
                counters.record(LockCounter::AcquireFailed);
                Err(e)
            }
        }
    }

    async fn wait_for_lease(
        &self,
        name: &LockName,
        owner: &LeaseOwner,
        timeout: Duration,
    ) -> Result<AcquireOutcome, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            let outcome = self
                .backend
                .try_acquire(name.as_str(), owner)
                .await
                .map_err(|source| LockError::Backend {
                    name: name.to_string(),
                    source,
                })?;

            if outcome != AcquireOutcome::Held {
                return Ok(outcome);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    name: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        }
    }
}

/// A held lock. The lease is released when this is dropped.
pub struct ScopedLock {
    name: LockName,
    owner: LeaseOwner,
    backend: Arc<dyn LeaseBackend>,
    counters: Arc<LockCounters>,
    local: Arc<Mutex<LocalState>>,
    acquired_at: Instant,
}

impl ScopedLock {
    pub fn name(&self) -> &LockName {
        &self.name
    }

    /// Returns true if this guard holds `name`.
    pub fn is_for(&self, name: &LockName) -> bool {
        self.name == *name
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl std::fmt::Debug for ScopedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedLock")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        {
            let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
            if local.held.get(&self.name) == Some(&self.owner.holder) {
                local.held.remove(&self.name);
            }
        }

        match self.backend.release(self.name.as_str(), &self.owner) {
            Ok(ReleaseOutcome::Released) => {
                self.counters.record(LockCounter::Release);
            }
            Ok(ReleaseOutcome::NotHeld) => {
                warn!(lock = %self.name, "Released lock whose lease no longer existed");
                self.counters.record(LockCounter::NakedRelease);
            }
            Ok(ReleaseOutcome::HeldByOther) => {
                warn!(lock = %self.name, "Released lock whose lease belongs to another owner");
                self.counters.record(LockCounter::ForeignRelease);
            }
            Err(e) => {
                warn!(lock = %self.name, error = %e, "Failed to release lock");
                self.counters.record(LockCounter::ReleaseFailed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::MemoryLeases;

    fn manager(leases: Arc<MemoryLeases>) -> LockManager {
        LockManager::new(leases, LockStats::new())
    }

    #[tokio::test]
    async fn test_acquire_and_release_are_counted() {
        let leases = Arc::new(MemoryLeases::new());
        let locks = manager(leases.clone());
        let name = LockName::unallocated();

        {
            let lock = locks.acquire(&name, Duration::from_secs(1)).await.unwrap();
            assert!(lock.is_for(&name));
            assert!(leases.owner(name.as_str()).is_some());
        }
        assert!(leases.owner(name.as_str()).is_none());

        let m = locks.stats().get(name.as_str());
        assert_eq!(m.acquire, 1);
        assert_eq!(m.locked, 1);
        assert_eq!(m.release, 1);
        assert!(m.attempts_balanced());
    }

    #[tokio::test]
    async fn test_partitions_do_not_contend() {
        let locks = manager(Arc::new(MemoryLeases::new()));
        let a = LockName::tenant(&TenantName::from("a").unwrap());
        let b = LockName::tenant(&TenantName::from("b").unwrap());

        let _a = locks.acquire(&a, Duration::from_millis(10)).await.unwrap();
        let _b = locks.acquire(&b, Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_reentry_is_deadlock() {
        let locks = manager(Arc::new(MemoryLeases::new()));
        let name = LockName::unallocated();

        let _held = locks.acquire(&name, Duration::from_secs(1)).await.unwrap();
        let err = locks.acquire(&name, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, LockError::Deadlock { .. }));
        assert!(!err.is_retryable());

        let m = locks.stats().get(name.as_str());
        assert_eq!(m.acquire, 2);
        assert_eq!(m.reentry, 1);
        assert_eq!(m.acquire_failed, 1);
        assert_eq!(m.locked, 1);
        assert!(m.attempts_balanced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_held_elsewhere() {
        let locks = Arc::new(manager(Arc::new(MemoryLeases::new())));
        let name = LockName::unallocated();

        let _held = locks.acquire(&name, Duration::from_secs(1)).await.unwrap();

        let contender = {
            let locks = Arc::clone(&locks);
            let name = name.clone();
            tokio::spawn(async move { locks.acquire(&name, Duration::from_millis(100)).await })
        };
        let err = contender.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(err.is_retryable());

        let m = locks.stats().get(name.as_str());
        assert_eq!(m.acquire_timed_out, 1);
        assert!(m.attempts_balanced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lock_after_release() {
        let locks = Arc::new(manager(Arc::new(MemoryLeases::new())));
        let name = LockName::unallocated();

        let held = locks.acquire(&name, Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let locks = Arc::clone(&locks);
            let name = name.clone();
            tokio::spawn(async move {
                locks.acquire(&name, Duration::from_secs(5)).await.map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
        let m = locks.stats().get(name.as_str());
        assert_eq!(m.locked, 2);
        assert_eq!(m.release, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cycle_is_deadlock() {
        let locks = Arc::new(manager(Arc::new(MemoryLeases::new())));
        let a = LockName::new("/locks/a");
        let b = LockName::new("/locks/b");

        let (holding_b, mut b_held) = tokio::sync::watch::channel(false);
        let other = {
            let locks = Arc::clone(&locks);
            let (a, b) = (a.clone(), b.clone());
            tokio::spawn(async move {
                let _b = locks.acquire(&b, Duration::from_secs(1)).await.unwrap();
                holding_b.send(true).unwrap();
                // Waits for `a`, which the test task holds.
                locks.acquire(&a, Duration::from_secs(10)).await.map(|_| ())
            })
        };

        let held_a = locks.acquire(&a, Duration::from_secs(1)).await.unwrap();
        b_held.wait_for(|held| *held).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = locks.acquire(&b, Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, LockError::Deadlock { .. }));
        assert_eq!(locks.stats().get(b.as_str()).deadlock, 1);

        drop(held_a);
        other.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_release_failure_is_counted() {
        let leases = Arc::new(MemoryLeases::new());
        let locks = manager(leases.clone());
        let name = LockName::unallocated();

        let lock = locks.acquire(&name, Duration::from_secs(1)).await.unwrap();
        leases.set_release_failure(true);
        drop(lock);

        let m = locks.stats().get(name.as_str());
        assert_eq!(m.release_failed, 1);
        assert_eq!(m.release, 0);
        assert_eq!(m.locked, m.release + m.release_failed);
    }

    #[tokio::test]
    async fn test_session_loss_gives_naked_release() {
        let leases = Arc::new(MemoryLeases::new());
        let locks = manager(leases.clone());
        let name = LockName::unallocated();

        let lock = locks.acquire(&name, Duration::from_secs(1)).await.unwrap();
        leases.expire_session();
        drop(lock);

        assert_eq!(locks.stats().get(name.as_str()).naked_release, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_gives_foreign_release_and_acquire_without_release() {
        let leases = Arc::new(MemoryLeases::with_ttl(Duration::from_secs(1)));
        let stats = LockStats::new();
        let first = LockManager::new(leases.clone(), Arc::clone(&stats));
        let second = LockManager::new(leases.clone(), Arc::clone(&stats));
        let name = LockName::unallocated();

        let stale = first.acquire(&name, Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        let fresh = second.acquire(&name, Duration::from_secs(1)).await.unwrap();
        drop(stale);
        drop(fresh);

        let m = stats.get(name.as_str());
        assert_eq!(m.acquire_without_release, 1);
        assert_eq!(m.foreign_release, 1);
        assert_eq!(m.release, 1);
        assert_eq!(m.releases(), 2);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Hold(usize),
        Contend(usize),
        ReleaseAll,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize).prop_map(Op::Hold),
            (0..3usize).prop_map(Op::Contend),
            Just(Op::ReleaseAll),
        ]
    }

    proptest! {
        #[test]
        fn test_counters_conserved(ops in proptest::collection::vec(op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let locks = Arc::new(manager(Arc::new(MemoryLeases::new())));
                let names: Vec<LockName> =
                    (0..3).map(|i| LockName::new(format!("/locks/{i}"))).collect();
                let mut held = Vec::new();

                for op in ops {
                    match op {
                        Op::Hold(i) => {
                            if let Ok(lock) = locks.acquire(&names[i], Duration::from_millis(5)).await {
                                held.push(lock);
                            }
                        }
                        Op::Contend(i) => {
                            let locks = Arc::clone(&locks);
                            let name = names[i].clone();
                            let _ = tokio::spawn(async move {
                                locks.acquire(&name, Duration::from_millis(5)).await.map(|_| ())
                            })
                            .await;
                        }
                        Op::ReleaseAll => held.clear(),
                    }
                }
                held.clear();

                let total = locks.stats().total();
                assert!(total.attempts_balanced());
                assert_eq!(total.locked, total.release + total.release_failed);
            });
        }
    }
}
