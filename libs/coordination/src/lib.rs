//! Coordination service primitives.
//!
//! Every process acting on fleet state goes through this crate for two
//! things: named mutual exclusion and versioned storage. Both are traits
//! ([`LeaseBackend`], [`VersionedStore`]) so the control plane never relies
//! on in-process memory being shared; the in-memory backends in [`memory`]
//! serve single-process deployments and tests.
//!
//! # Invariants
//!
//! - Every lock attempt is counted exactly once in [`LockStats`]
//! - A [`ScopedLock`] releases its lease when dropped, on every path
//! - A [`Transaction`] commits all of its operations or none of them

mod error;
mod lease;
mod lock;
pub mod memory;
mod stats;
mod store;

pub use error::{CoordinationError, LockError};
pub use lease::{AcquireOutcome, HolderId, LeaseBackend, LeaseOwner, ReleaseOutcome};
pub use lock::{LockManager, LockManagerConfig, LockName, ScopedLock};
pub use memory::{MemoryLeases, MemoryStore};
pub use stats::{LockCounter, LockCounters, LockMetrics, LockStats};
pub use store::{
    read_json, read_modify_write, ExpectedVersion, Operation, Transaction, Version, Versioned,
    VersionedStore, DEFAULT_MODIFY_ATTEMPTS,
};
