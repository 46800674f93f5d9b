//! Periodic maintainer runner.
//!
//! Runs a maintainer on a fixed interval until shutdown is signaled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::DEFAULT_MAINTAINER_INTERVAL;

/// A periodic maintenance job.
#[async_trait]
pub trait Maintainer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Runs one pass. Returns true if every unit of work succeeded.
    async fn maintain(&self) -> bool;
}

/// Maintainer worker that runs one maintainer on an interval.
pub struct MaintainerWorker {
    maintainer: Arc<dyn Maintainer>,
    interval: Duration,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl MaintainerWorker {
    /// Create a new maintainer worker.
    ///
    /// A zero interval falls back to [`DEFAULT_MAINTAINER_INTERVAL`].
    pub fn new(maintainer: Arc<dyn Maintainer>, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            warn!(
                maintainer = maintainer.name(),
                "Zero maintainer interval, using the default"
            );
            DEFAULT_MAINTAINER_INTERVAL
        } else {
            interval
        };
        Self {
            maintainer,
            interval,
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completed runs.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    /// Completed runs that reported failure.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Run the maintainer until shutdown is signaled.
    ///
    /// A run that outlasts the interval is never aborted; the ticks it
    /// missed are skipped and the next run starts on the following tick.
    #[instrument(skip(self, shutdown), fields(maintainer = self.maintainer.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting maintainer"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_once().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Maintainer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single maintenance pass.
    pub async fn run_once(&self) -> bool {
        let success = self.maintainer.maintain().await;
        self.runs.fetch_add(1, Ordering::Relaxed);

        if success {
            debug!("Maintenance pass complete");
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!("Maintenance pass had failures, retrying next interval");
        }

        success
    }
}
