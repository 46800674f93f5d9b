//! Config server errors.

use std::time::Duration;

use fleet_coordination::{CoordinationError, LockError};
use fleet_id::ApplicationId;
use thiserror::Error;

/// Errors from the reindexing store and the application registry.
#[derive(Debug, Error)]
pub enum ReindexingError {
    #[error("application {0} not found")]
    ApplicationNotFound(ApplicationId),

    #[error("{application} has no cluster '{cluster}'")]
    UnknownCluster {
        application: ApplicationId,
        cluster: String,
    },

    #[error("cluster '{cluster}' of {application} has no document type '{document_type}'")]
    UnknownDocumentType {
        application: ApplicationId,
        cluster: String,
        document_type: String,
    },

    /// A write was attempted without the tenant lock.
    #[error("writing {application} requires holding lock '{required}'")]
    LockNotHeld {
        application: ApplicationId,
        required: String,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

/// Errors from querying a service for its config generation.
#[derive(Debug, Error)]
pub enum ConvergenceError {
    /// The service did not answer in time.
    #[error("timed out after {timeout:?} waiting for config generation of {service}")]
    Timeout { service: String, timeout: Duration },

    #[error("request to {service} failed: {message}")]
    Request { service: String, message: String },

    #[error("invalid response from {service}: {message}")]
    InvalidResponse { service: String, message: String },

    #[error("no service '{0}' in application")]
    UnknownService(String),
}

/// Errors from a maintenance pass.
#[derive(Debug, Error)]
pub enum MaintenanceError {
    /// Processing of one application failed. Other applications are unaffected.
    #[error("failed to update reindexing status for {application}: {source}")]
    Application {
        application: ApplicationId,
        #[source]
        source: ReindexingError,
    },

    #[error("failed to list applications: {0}")]
    Listing(#[source] ReindexingError),
}
