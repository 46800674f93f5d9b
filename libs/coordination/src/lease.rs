//! Named leases held in the coordination service.

use async_trait::async_trait;
use uuid::Uuid;

use crate::CoordinationError;

/// Identity of the code path holding or waiting for a lock.
///
/// Inside a tokio task this is the task id; elsewhere it is the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HolderId {
    Task(tokio::task::Id),
    Thread(std::thread::ThreadId),
}

impl HolderId {
    pub fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Self::Task(id),
            None => Self::Thread(std::thread::current().id()),
        }
    }
}

impl std::fmt::Display for HolderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Task(id) => write!(f, "task-{id}"),
            Self::Thread(id) => write!(f, "{id:?}"),
        }
    }
}

/// Owner recorded on a lease: the process session plus the local holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseOwner {
    pub session: Uuid,
    pub holder: HolderId,
}

impl std::fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session, self.holder)
    }
}

/// Result of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The lease was free and is now ours.
    Acquired,
    /// The previous owner's lease expired without being released; it is now ours.
    AcquiredExpired,
    /// Someone else holds the lease.
    Held,
}

/// Result of releasing a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// No lease existed, e.g. after the session was lost.
    NotHeld,
    /// The lease now belongs to another owner.
    HeldByOther,
}

/// Lease primitive of the coordination service.
///
/// `release` is synchronous because it runs when a lock guard is dropped.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn try_acquire(
        &self,
        name: &str,
        owner: &LeaseOwner,
    ) -> Result<AcquireOutcome, CoordinationError>;

    fn release(&self, name: &str, owner: &LeaseOwner) -> Result<ReleaseOutcome, CoordinationError>;
}
