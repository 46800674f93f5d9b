//! Application state shared across request handlers.

use std::sync::Arc;

use crate::convergence::ConvergenceChecker;
use crate::tenant::TenantRepository;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    tenants: Arc<TenantRepository>,
    convergence: Arc<ConvergenceChecker>,
}

impl AppState {
    pub fn new(tenants: Arc<TenantRepository>, convergence: Arc<ConvergenceChecker>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                tenants,
                convergence,
            }),
        }
    }

    /// Tenants, applications and their reindexing status.
    pub fn tenants(&self) -> &TenantRepository {
        &self.inner.tenants
    }

    pub fn convergence(&self) -> &ConvergenceChecker {
        &self.inner.convergence
    }
}
