//! Periodic update of reindexing status.
//!
//! On each pass, for every active application:
//!
//! 1. Pending document types whose required generation has converged on
//!    all services are marked ready now.
//! 2. The whole application is marked ready again on a fixed cadence
//!    anchored at its last common readiness, so repeated runs agree on the
//!    timestamps regardless of when they happen.
//!
//! One application failing does not stop the others.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::ApplicationId;
use fleet_reconcile::{Clock, Maintainer, Memoized};
use tracing::{debug, info, instrument, warn};

use crate::convergence::{ConvergenceChecker, ServiceInstance};
use crate::reindexing::ApplicationReindexing;
use crate::tenant::{ApplicationRecord, TenantRepository};
use crate::{MaintenanceError, ReindexingError};

/// Default cadence of periodic reindexing, in days.
pub const DEFAULT_REINDEXING_INTERVAL_DAYS: i64 = 28;

#[derive(Debug, Clone)]
pub struct ReindexingMaintainerConfig {
    /// Cadence of periodic whole-application reindexing.
    pub reindexing_interval: chrono::Duration,
}

impl Default for ReindexingMaintainerConfig {
    fn default() -> Self {
        Self {
            reindexing_interval: chrono::Duration::days(DEFAULT_REINDEXING_INTERVAL_DAYS),
        }
    }
}

/// Resolves converged pending reindexing and schedules periodic reindexing.
///
/// `oldest` is the oldest config generation running across the
/// application's services, or `None` if that is unknown. Pending entries
/// are only resolved when it is known.
pub fn with_new_ready(
    mut reindexing: ApplicationReindexing,
    oldest: Option<i64>,
    now: DateTime<Utc>,
    interval: chrono::Duration,
) -> ApplicationReindexing {
    if let Some(oldest) = oldest {
        let converged: Vec<(String, String)> = reindexing
            .pending()
            .filter(|(_, _, generation)| *generation <= oldest)
            .map(|(cluster, doc_type, _)| (cluster.to_string(), doc_type.to_string()))
            .collect();
        for (cluster, doc_type) in converged {
            reindexing = reindexing.with_ready_type(&cluster, &doc_type, now);
        }
    }

    if interval > chrono::Duration::zero() {
        let mut next = reindexing.common().ready();
        while let Some(candidate) = next.checked_add_signed(interval) {
            if candidate >= now {
                break;
            }
            reindexing = reindexing.with_ready(candidate);
            next = candidate;
        }
    }
    reindexing
}

/// The oldest config generation of one application, fetched at most once.
struct LazyGeneration<'a> {
    checker: &'a ConvergenceChecker,
    application: &'a ApplicationId,
    services: &'a [ServiceInstance],
    value: Memoized<Option<i64>>,
}

impl<'a> LazyGeneration<'a> {
    fn new(checker: &'a ConvergenceChecker, record: &'a ApplicationRecord) -> Self {
        Self {
            checker,
            application: &record.id,
            services: &record.services,
            value: Memoized::new(),
        }
    }

    /// An unreachable or slow service leaves the generation unknown.
    async fn get(&self) -> Option<i64> {
        self.value
            .get_or_init(|| async {
                match self.checker.oldest_generation(self.services).await {
                    Ok(generation) => generation,
                    Err(e) => {
                        info!(
                            application = %self.application,
                            error = %e,
                            "Config generation unknown, keeping pending reindexing"
                        );
                        None
                    }
                }
            })
            .await
    }
}

/// Keeps the reindexing status of every active application current.
pub struct ReindexingMaintainer {
    tenants: Arc<TenantRepository>,
    convergence: Arc<ConvergenceChecker>,
    clock: Arc<dyn Clock>,
    config: ReindexingMaintainerConfig,
}

impl ReindexingMaintainer {
    pub fn new(
        tenants: Arc<TenantRepository>,
        convergence: Arc<ConvergenceChecker>,
        clock: Arc<dyn Clock>,
        config: ReindexingMaintainerConfig,
    ) -> Self {
        Self {
            tenants,
            convergence,
            clock,
            config,
        }
    }

    /// Runs one pass over all applications. Returns the failures.
    pub async fn run(&self) -> Result<Vec<MaintenanceError>, MaintenanceError> {
        let mut failures = Vec::new();
        for tenant in self.tenants.tenants().await.map_err(MaintenanceError::Listing)? {
            let applications = match self.tenants.active_applications(&tenant).await {
                Ok(applications) => applications,
                Err(e) => {
                    warn!(%tenant, error = %e, "Failed to list applications");
                    failures.push(MaintenanceError::Listing(e));
                    continue;
                }
            };
            for application in applications {
                if let Err(e) = self.maintain_application(&application).await {
                    info!(error = %e, "Reindexing maintenance failed");
                    failures.push(e);
                }
            }
        }
        Ok(failures)
    }

    /// Updates the reindexing status of one application.
    #[instrument(skip_all, fields(application = %application.id))]
    pub async fn maintain_application(&self, application: &ApplicationRecord) -> Result<(), MaintenanceError> {
        let wrap = |source: ReindexingError| MaintenanceError::Application {
            application: application.id.clone(),
            source,
        };
        let store = self.tenants.reindexing();
        let generation = LazyGeneration::new(&self.convergence, application);

        // The generation is fetched outside the lock, and only when needed.
        let current = store.read(&application.id).await.map_err(wrap)?;
        let oldest = if current.has_pending() {
            generation.get().await
        } else {
            None
        };

        let now = self.clock.now();
        let interval = self.config.reindexing_interval;
        let updated = match store
            .modify(&application.id, |reindexing| {
                with_new_ready(reindexing, oldest, now, interval)
            })
            .await
        {
            Ok(updated) => updated,
            Err(ReindexingError::ApplicationNotFound(_)) => {
                debug!("Application removed during maintenance");
                return Ok(());
            }
            Err(e) => return Err(wrap(e)),
        };
        debug!(
            ready = %updated.common().ready(),
            pending = updated.pending().count(),
            "Updated reindexing status"
        );
        Ok(())
    }
}

#[async_trait]
impl Maintainer for ReindexingMaintainer {
    fn name(&self) -> &'static str {
        "ReindexingMaintainer"
    }

    async fn maintain(&self) -> bool {
        match self.run().await {
            Ok(failures) => failures.is_empty(),
            Err(e) => {
                warn!(error = %e, "Reindexing maintenance aborted");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn days(n: i64) -> chrono::Duration {
        chrono::Duration::days(n)
    }

    fn interval() -> chrono::Duration {
        ReindexingMaintainerConfig::default().reindexing_interval
    }

    fn pending() -> ApplicationReindexing {
        ApplicationReindexing::ready(t0())
            .with_pending("music", "album", 5)
            .with_pending("music", "artist", 7)
            .with_pending("books", "book", 6)
    }

    #[test]
    fn test_converged_pending_becomes_ready() {
        let now = t0() + chrono::Duration::hours(1);
        let updated = with_new_ready(pending(), Some(6), now, interval());

        let music = updated.cluster("music").unwrap();
        assert_eq!(music.ready()["album"].ready(), now);
        assert_eq!(music.pending()["artist"], 7);
        assert_eq!(updated.cluster("books").unwrap().ready()["book"].ready(), now);
        assert_eq!(updated.common().ready(), t0());
    }

    #[test]
    fn test_unknown_generation_keeps_pending() {
        let now = t0() + days(1);
        let updated = with_new_ready(pending(), None, now, interval());
        assert_eq!(updated, pending());
    }

    #[test]
    fn test_update_is_idempotent() {
        let now = t0() + days(60);
        let once = with_new_ready(pending(), Some(6), now, interval());
        let twice = with_new_ready(once.clone(), Some(6), now, interval());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_periodic_ready_is_anchored() {
        let start = ApplicationReindexing::ready(t0());

        let early = with_new_ready(start.clone(), None, t0() + days(30), interval());
        let late = with_new_ready(start.clone(), None, t0() + days(31), interval());
        assert_eq!(early.common().ready(), t0() + days(28));
        assert_eq!(late.common().ready(), t0() + days(28));

        // Only instants strictly before now count.
        let updated = with_new_ready(start.clone(), None, t0() + days(70), interval());
        assert_eq!(updated.common().ready(), t0() + days(56));
        let updated = with_new_ready(start.clone(), None, t0() + days(56), interval());
        assert_eq!(updated.common().ready(), t0() + days(28));
        let updated = with_new_ready(start, None, t0() + days(20), interval());
        assert_eq!(updated.common().ready(), t0());
    }

    #[test]
    fn test_zero_interval_disables_periodic_ready() {
        let start = ApplicationReindexing::ready(t0());
        let updated = with_new_ready(start.clone(), None, t0() + days(365), chrono::Duration::zero());
        assert_eq!(updated, start);
    }
}
