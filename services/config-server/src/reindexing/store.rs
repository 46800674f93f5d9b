//! Persistence of reindexing status.
//!
//! One JSON document per application, stored under its tenant. Every write
//! holds the tenant lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_coordination::{
    read_json, read_modify_write, ExpectedVersion, LockManager, LockName, ScopedLock, Transaction,
    VersionedStore, DEFAULT_MODIFY_ATTEMPTS,
};
use fleet_id::ApplicationId;
use tracing::{debug, instrument};

use super::ApplicationReindexing;
use crate::tenant::{application_key, TENANTS_PATH};
use crate::ReindexingError;

/// Key of the reindexing status of `id`.
pub fn reindexing_key(id: &ApplicationId) -> String {
    format!(
        "{TENANTS_PATH}{}/reindexing/{}",
        id.tenant(),
        id.serialized_form()
    )
}

/// Reads and writes [`ApplicationReindexing`] documents.
#[derive(Clone)]
pub struct ReindexingStore {
    store: Arc<dyn VersionedStore>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl ReindexingStore {
    pub fn new(store: Arc<dyn VersionedStore>, locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            store,
            locks,
            lock_timeout,
        }
    }

    /// The stored status, or `None` if the application has none.
    pub async fn find(&self, id: &ApplicationId) -> Result<Option<ApplicationReindexing>, ReindexingError> {
        let stored = read_json(self.store.as_ref(), &reindexing_key(id)).await?;
        Ok(stored.map(|v| v.value))
    }

    /// The stored status, or the empty default if there is none.
    pub async fn read(&self, id: &ApplicationId) -> Result<ApplicationReindexing, ReindexingError> {
        Ok(self.find(id).await?.unwrap_or_default())
    }

    /// Applies `modify` to the stored status under the tenant lock.
    ///
    /// `modify` may run more than once and must be pure. A missing status
    /// starts from the empty default. Fails with `ApplicationNotFound` if
    /// the application was removed, so no status outlives its application.
    #[instrument(skip(self, modify), fields(application = %id))]
    pub async fn modify<F>(&self, id: &ApplicationId, modify: F) -> Result<ApplicationReindexing, ReindexingError>
    where
        F: Fn(ApplicationReindexing) -> ApplicationReindexing,
    {
        let _lock = self
            .locks
            .acquire(&LockName::tenant(id.tenant()), self.lock_timeout)
            .await?;
        if self.store.read(&application_key(id)).await?.is_none() {
            return Err(ReindexingError::ApplicationNotFound(id.clone()));
        }
        let updated = read_modify_write(
            self.store.as_ref(),
            &reindexing_key(id),
            DEFAULT_MODIFY_ATTEMPTS,
            |current: Option<ApplicationReindexing>| modify(current.unwrap_or_default()),
        )
        .await?;
        debug!("Updated reindexing status");
        Ok(updated)
    }

    /// Stages a modification into `transaction`. The caller holds the tenant lock.
    ///
    /// A missing status starts as ready at `created`.
    pub(crate) async fn stage_modify<F>(
        &self,
        id: &ApplicationId,
        lock: &ScopedLock,
        transaction: &mut Transaction,
        created: DateTime<Utc>,
        modify: F,
    ) -> Result<ApplicationReindexing, ReindexingError>
    where
        F: FnOnce(ApplicationReindexing) -> ApplicationReindexing,
    {
        require_tenant_lock(id, lock)?;
        let key = reindexing_key(id);
        let current = read_json::<ApplicationReindexing>(self.store.as_ref(), &key).await?;
        let expected = ExpectedVersion::of(current.as_ref());
        let base = current.map_or_else(|| ApplicationReindexing::ready(created), |c| c.value);
        let updated = modify(base);
        transaction.put_json(key, &updated, expected)?;
        Ok(updated)
    }

    /// Stages removal of the status into `transaction`. The caller holds the tenant lock.
    pub(crate) async fn stage_delete(
        &self,
        id: &ApplicationId,
        lock: &ScopedLock,
        transaction: &mut Transaction,
    ) -> Result<bool, ReindexingError> {
        require_tenant_lock(id, lock)?;
        let key = reindexing_key(id);
        match self.store.read(&key).await? {
            Some(current) => {
                transaction.delete(key, ExpectedVersion::of(Some(&current)));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn require_tenant_lock(id: &ApplicationId, lock: &ScopedLock) -> Result<(), ReindexingError> {
    let required = LockName::tenant(id.tenant());
    if lock.is_for(&required) {
        Ok(())
    } else {
        Err(ReindexingError::LockNotHeld {
            application: id.clone(),
            required: required.to_string(),
        })
    }
}
