//! Fleet config server library.
//!
//! This crate primarily ships a `config-server` binary, but exposes its
//! components as a library for integration testing and reuse.
//!
//! - [`tenant`]: registry of tenants and their deployed applications
//! - [`reindexing`]: per-application reindexing status and its store
//! - [`convergence`]: observed config generations of running services
//! - [`maintenance`]: the reindexing maintainer
//! - [`api`]: HTTP surface

pub mod api;
pub mod config;
pub mod convergence;
mod error;
pub mod maintenance;
pub mod reindexing;
pub mod state;
pub mod tenant;

pub use error::{ConvergenceError, MaintenanceError, ReindexingError};
