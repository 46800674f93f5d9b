//! Node repository errors.

use fleet_coordination::{CoordinationError, LockError};
use fleet_id::HostName;
use thiserror::Error;

use crate::NodeState;

/// Result type for node repository operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Errors that can occur while reading or changing nodes.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The state change violates the lifecycle rules. Nothing was written.
    #[error("cannot move {hostname} from {from} to {to}: {reason}")]
    InvalidTransition {
        hostname: HostName,
        from: NodeState,
        to: NodeState,
        reason: String,
    },

    /// The caller does not hold the lock guarding this node.
    #[error("writing {hostname} requires holding lock '{required}'")]
    LockNotHeld { hostname: HostName, required: String },

    #[error("node {0} not found")]
    NotFound(HostName),

    #[error("node {0} already exists")]
    AlreadyExists(HostName),

    /// Granted resources do not fit the node's flavor.
    #[error("allocation on {hostname} requests {requested} but flavor '{flavor}' has {available}")]
    ResourcesExceedFlavor {
        hostname: HostName,
        flavor: String,
        requested: String,
        available: String,
    },

    #[error("invalid allocation for {hostname}: {reason}")]
    InvalidAllocation { hostname: HostName, reason: String },

    #[error("invalid cluster membership '{0}'")]
    InvalidMembership(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}
