//! Coordination error types.

use std::time::Duration;

use thiserror::Error;

/// Storage and lease backend errors.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Optimistic concurrency check failed.
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: String,
        actual: String,
    },

    /// Value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend rejected or failed the request.
    #[error("coordination backend error: {0}")]
    Backend(String),
}

impl CoordinationError {
    /// Returns true if retrying the read-modify-write may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Lock acquisition errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock was not acquired within the timeout. Nothing was applied.
    #[error("timed out after {timeout:?} waiting for lock '{name}'")]
    Timeout { name: String, timeout: Duration },

    /// Waiting would block forever. This is a programming error.
    #[error("deadlock acquiring lock '{name}': {reason}")]
    Deadlock { name: String, reason: String },

    /// The lease backend failed.
    #[error("failed to acquire lock '{name}': {source}")]
    Backend {
        name: String,
        #[source]
        source: CoordinationError,
    },
}

impl LockError {
    /// Returns true if the caller may try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Backend { .. })
    }
}
