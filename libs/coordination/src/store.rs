//! Versioned key-value storage.
//!
//! Values are opaque bytes tagged with a per-key version that increases on
//! every write. Writers state the version they read; a commit whose
//! expectations no longer hold is rejected as a whole.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::CoordinationError;

/// Per-key version. The first write of a key produces version 1.
pub type Version = u64;

/// Attempts made by [`read_modify_write`] before giving up on conflicts.
pub const DEFAULT_MODIFY_ATTEMPTS: u32 = 5;

/// A value together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

/// Precondition on the stored version of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No precondition.
    Any,
    /// The key must not exist.
    Absent,
    /// The key must exist at exactly this version.
    Exactly(Version),
}

impl ExpectedVersion {
    /// The precondition matching what was read.
    pub fn of<T>(read: Option<&Versioned<T>>) -> Self {
        match read {
            Some(versioned) => Self::Exactly(versioned.version),
            None => Self::Absent,
        }
    }

    pub fn matches(&self, current: Option<Version>) -> bool {
        match (self, current) {
            (Self::Any, _) => true,
            (Self::Absent, None) => true,
            (Self::Exactly(expected), Some(actual)) => *expected == actual,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Absent => f.write_str("absent"),
            Self::Exactly(v) => write!(f, "version {v}"),
        }
    }
}

/// A single write inside a [`Transaction`].
#[derive(Debug, Clone)]
pub enum Operation {
    Put {
        key: String,
        value: Vec<u8>,
        expected: ExpectedVersion,
    },
    Delete {
        key: String,
        expected: ExpectedVersion,
    },
}

impl Operation {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    pub fn expected(&self) -> ExpectedVersion {
        match self {
            Self::Put { expected, .. } | Self::Delete { expected, .. } => *expected,
        }
    }
}

/// An ordered set of writes applied atomically by [`VersionedStore::commit`].
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Vec<u8>, expected: ExpectedVersion) {
        self.operations.push(Operation::Put {
            key: key.into(),
            value,
            expected,
        });
    }

    /// Adds a put of `value` serialized as JSON.
    pub fn put_json<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
        expected: ExpectedVersion,
    ) -> Result<(), CoordinationError> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, bytes, expected);
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>, expected: ExpectedVersion) {
        self.operations.push(Operation::Delete {
            key: key.into(),
            expected,
        });
    }

    /// Moves all operations of `other` into this transaction.
    pub fn append(&mut self, other: Transaction) {
        self.operations.extend(other.operations);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

/// Strongly consistent, versioned key-value storage.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Reads a key, returning `None` if it does not exist.
    async fn read(&self, key: &str) -> Result<Option<Versioned<Vec<u8>>>, CoordinationError>;

    /// Lists the keys starting with `prefix`, in sorted order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, CoordinationError>;

    /// Applies all operations, or none if any precondition fails.
    async fn commit(&self, transaction: Transaction) -> Result<(), CoordinationError>;
}

/// Reads and deserializes a JSON value.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn VersionedStore,
    key: &str,
) -> Result<Option<Versioned<T>>, CoordinationError> {
    let Some(raw) = store.read(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&raw.value)?;
    Ok(Some(Versioned {
        value,
        version: raw.version,
    }))
}

/// Applies `modify` to the value stored at `key` with optimistic retry.
///
/// `modify` receives `None` when the key does not exist and must be pure:
/// it runs again after every version conflict. Unchanged values are not
/// written back. Returns the value now stored.
pub async fn read_modify_write<T, F>(
    store: &dyn VersionedStore,
    key: &str,
    max_attempts: u32,
    modify: F,
) -> Result<T, CoordinationError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(Option<T>) -> T,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let current = store.read(key).await?;
        let expected = ExpectedVersion::of(current.as_ref());
        let old_bytes = current.as_ref().map(|c| c.value.clone());
        let old = match &current {
            Some(raw) => Some(serde_json::from_slice(&raw.value)?),
            None => None,
        };

        let new = modify(old);
        let new_bytes = serde_json::to_vec(&new)?;
        if old_bytes.as_deref() == Some(new_bytes.as_slice()) {
            return Ok(new);
        }

        let mut transaction = Transaction::new();
        transaction.put(key, new_bytes, expected);
        match store.commit(transaction).await {
            Ok(()) => return Ok(new),
            Err(e) if e.is_conflict() && attempt < max_attempts => {
                debug!(key, attempt, "Version conflict, retrying modification");
            }
            Err(e) => return Err(e),
        }
    }
}
