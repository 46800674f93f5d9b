//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing maintainers: periodic
//! tasks that move derived state toward what the observed runtime allows.
//! Key concepts:
//!
//! - **Derived state**: What the control plane records (e.g. reindexing status).
//! - **Observed state**: What running services report (e.g. config generations).
//! - **Convergence**: Every running service has applied a given generation.
//!
//! # Invariants
//!
//! - Maintainer runs are idempotent
//! - Decisions are deterministic given the same inputs and clock
//! - Retry is time driven: a failed run is retried by the next tick, never inline

mod worker;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;

pub use worker::{Maintainer, MaintainerWorker};

/// Convergence status for a service or application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceStatus {
    /// The observed generation has reached the wanted generation.
    Converged,

    /// The observed generation is still behind.
    Converging,

    /// Status is unknown (the service did not answer).
    Unknown,
}

impl ConvergenceStatus {
    /// Compares an observed generation with the wanted one.
    pub fn of(wanted: i64, current: Option<i64>) -> Self {
        match current {
            Some(current) if current >= wanted => Self::Converged,
            Some(_) => Self::Converging,
            None => Self::Unknown,
        }
    }

    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
        })
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A value computed at most once, on first demand.
///
/// Concurrent callers wait for the single in-flight computation.
#[derive(Debug)]
pub struct Memoized<T> {
    cell: OnceCell<T>,
}

impl<T> Default for Memoized<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

impl<T: Clone> Memoized<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value, computing it with `init` if this is the first call.
    pub async fn get_or_init<F, Fut>(&self, init: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.cell.get_or_init(init).await.clone()
    }

    /// Returns the value if it has been computed.
    pub fn get(&self) -> Option<T> {
        self.cell.get().cloned()
    }
}

/// Default maintainer interval.
pub const DEFAULT_MAINTAINER_INTERVAL: Duration = Duration::from_secs(5 * 60);
