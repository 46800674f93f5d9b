//! Tenants and their deployed applications.
//!
//! Each deployment writes an [`ApplicationRecord`] holding the application's
//! config generation, its content clusters with their document types, and
//! the services it runs. Deploying also creates the reindexing status and
//! registers reindexing that the new generation requires, in the same
//! transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_coordination::{
    read_json, ExpectedVersion, LockManager, LockName, ScopedLock, Transaction, VersionedStore,
};
use fleet_id::{ApplicationId, TenantName};
use fleet_reconcile::Clock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::convergence::ServiceInstance;
use crate::reindexing::ReindexingStore;
use crate::ReindexingError;

/// Root of all tenant data.
pub const TENANTS_PATH: &str = "/config/v2/tenants/";

pub fn tenant_key(tenant: &TenantName) -> String {
    format!("{TENANTS_PATH}{tenant}")
}

pub fn application_key(id: &ApplicationId) -> String {
    format!(
        "{TENANTS_PATH}{}/applications/{}",
        id.tenant(),
        id.serialized_form()
    )
}

/// A deployed application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub id: ApplicationId,
    /// Config generation of the latest deployment.
    pub generation: i64,
    pub active: bool,
    /// Content cluster name to its document types.
    #[serde(default)]
    pub clusters: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub services: Vec<ServiceInstance>,
}

impl ApplicationRecord {
    pub fn new(id: ApplicationId) -> Self {
        Self {
            id,
            generation: 0,
            active: true,
            clusters: BTreeMap::new(),
            services: Vec::new(),
        }
    }

    pub fn with_cluster<'a>(mut self, name: &str, document_types: impl IntoIterator<Item = &'a str>) -> Self {
        self.clusters.insert(
            name.to_string(),
            document_types.into_iter().map(str::to_string).collect(),
        );
        self
    }

    pub fn with_service(mut self, service: ServiceInstance) -> Self {
        self.services.push(service);
        self
    }

    /// Selects `(cluster, document type)` pairs by name.
    ///
    /// No clusters selects every cluster and no types selects every type of
    /// the selected clusters. Named clusters must exist, and every named
    /// type must exist in at least one selected cluster.
    pub fn document_types(
        &self,
        clusters: &[String],
        types: &[String],
    ) -> Result<Vec<(String, String)>, ReindexingError> {
        let selected: Vec<(&String, &BTreeSet<String>)> = if clusters.is_empty() {
            self.clusters.iter().collect()
        } else {
            clusters
                .iter()
                .map(|name| {
                    self.clusters
                        .get_key_value(name)
                        .ok_or_else(|| ReindexingError::UnknownCluster {
                            application: self.id.clone(),
                            cluster: name.clone(),
                        })
                })
                .collect::<Result<_, _>>()?
        };

        if let Some(missing) = types
            .iter()
            .find(|t| !selected.iter().any(|(_, known)| known.contains(*t)))
        {
            return Err(ReindexingError::UnknownDocumentType {
                application: self.id.clone(),
                cluster: clusters.join(","),
                document_type: missing.clone(),
            });
        }

        Ok(selected
            .into_iter()
            .flat_map(move |(cluster, known)| {
                known
                    .iter()
                    .filter(move |t| types.is_empty() || types.contains(*t))
                    .map(move |t| (cluster.clone(), t.clone()))
            })
            .collect())
    }

    /// Looks up a service by `host:port`.
    pub fn service(&self, host_and_port: &str) -> Option<&ServiceInstance> {
        self.services
            .iter()
            .find(|s| s.host_and_port() == host_and_port)
    }
}

/// Reindexing that a deployment requires before new documents can be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReindexAction {
    pub cluster: String,
    pub document_type: String,
}

impl ReindexAction {
    pub fn new(cluster: &str, document_type: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            document_type: document_type.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TenantRecord {
    name: TenantName,
    created_at: DateTime<Utc>,
}

/// Registry of tenants and applications.
pub struct TenantRepository {
    store: Arc<dyn VersionedStore>,
    locks: Arc<LockManager>,
    reindexing: ReindexingStore,
    clock: Arc<dyn Clock>,
    lock_timeout: Duration,
}

impl TenantRepository {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        lock_timeout: Duration,
    ) -> Self {
        let reindexing = ReindexingStore::new(store.clone(), locks.clone(), lock_timeout);
        Self {
            store,
            locks,
            reindexing,
            clock,
            lock_timeout,
        }
    }

    pub fn reindexing(&self) -> &ReindexingStore {
        &self.reindexing
    }

    /// Takes the lock guarding everything `tenant` owns.
    pub async fn lock(&self, tenant: &TenantName) -> Result<ScopedLock, ReindexingError> {
        Ok(self
            .locks
            .acquire(&LockName::tenant(tenant), self.lock_timeout)
            .await?)
    }

    /// Creates a tenant. Returns false if it already exists.
    pub async fn add_tenant(&self, tenant: &TenantName) -> Result<bool, ReindexingError> {
        let _lock = self.lock(tenant).await?;
        let mut transaction = Transaction::new();
        let created = self.stage_tenant(tenant, &mut transaction).await?;
        if created {
            self.store.commit(transaction).await?;
            info!(%tenant, "Created tenant");
        }
        Ok(created)
    }

    /// All tenants, sorted by name.
    pub async fn tenants(&self) -> Result<Vec<TenantName>, ReindexingError> {
        let keys = self.store.list(TENANTS_PATH).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(TENANTS_PATH))
            .filter(|rest| !rest.contains('/'))
            .filter_map(|name| match TenantName::from(name) {
                Ok(tenant) => Some(tenant),
                Err(e) => {
                    warn!(key = name, error = %e, "Skipping malformed tenant key");
                    None
                }
            })
            .collect())
    }

    pub async fn application(&self, id: &ApplicationId) -> Result<Option<ApplicationRecord>, ReindexingError> {
        let stored = read_json(self.store.as_ref(), &application_key(id)).await?;
        Ok(stored.map(|v| v.value))
    }

    /// Like [`Self::application`], but a missing application is an error.
    pub async fn require(&self, id: &ApplicationId) -> Result<ApplicationRecord, ReindexingError> {
        self.application(id)
            .await?
            .ok_or_else(|| ReindexingError::ApplicationNotFound(id.clone()))
    }

    /// Every application of `tenant`, sorted by id.
    pub async fn applications(&self, tenant: &TenantName) -> Result<Vec<ApplicationRecord>, ReindexingError> {
        let prefix = format!("{}/applications/", tenant_key(tenant));
        let mut records = Vec::new();
        for key in self.store.list(&prefix).await? {
            if let Some(stored) = read_json::<ApplicationRecord>(self.store.as_ref(), &key).await? {
                records.push(stored.value);
            }
        }
        Ok(records)
    }

    pub async fn active_applications(&self, tenant: &TenantName) -> Result<Vec<ApplicationRecord>, ReindexingError> {
        let mut records = self.applications(tenant).await?;
        records.retain(|r| r.active);
        Ok(records)
    }

    /// Deploys `record` as the next config generation of its application.
    ///
    /// Creates the tenant and the reindexing status when missing, and marks
    /// every document type in `reindex` pending on the new generation.
    /// Returns the record as stored.
    #[instrument(skip_all, fields(application = %record.id))]
    pub async fn deploy(
        &self,
        mut record: ApplicationRecord,
        reindex: &[ReindexAction],
    ) -> Result<ApplicationRecord, ReindexingError> {
        let id = record.id.clone();
        for action in reindex {
            let types = record
                .clusters
                .get(&action.cluster)
                .ok_or_else(|| ReindexingError::UnknownCluster {
                    application: id.clone(),
                    cluster: action.cluster.clone(),
                })?;
            if !types.contains(&action.document_type) {
                return Err(ReindexingError::UnknownDocumentType {
                    application: id.clone(),
                    cluster: action.cluster.clone(),
                    document_type: action.document_type.clone(),
                });
            }
        }

        let lock = self.lock(id.tenant()).await?;
        let mut transaction = Transaction::new();
        self.stage_tenant(id.tenant(), &mut transaction).await?;

        let key = application_key(&id);
        let current = read_json::<ApplicationRecord>(self.store.as_ref(), &key).await?;
        record.generation = current.as_ref().map_or(1, |c| c.value.generation + 1);
        record.active = true;
        transaction.put_json(&key, &record, ExpectedVersion::of(current.as_ref()))?;

        let generation = record.generation;
        self.reindexing
            .stage_modify(&id, &lock, &mut transaction, self.clock.now(), |mut status| {
                for action in reindex {
                    status = status.with_pending(&action.cluster, &action.document_type, generation);
                }
                status
            })
            .await?;

        self.store.commit(transaction).await?;
        info!(generation, pending = reindex.len(), "Deployed application");
        Ok(record)
    }

    /// Marks an application inactive. Its reindexing status is kept.
    pub async fn deactivate(&self, id: &ApplicationId) -> Result<ApplicationRecord, ReindexingError> {
        let _lock = self.lock(id.tenant()).await?;
        let key = application_key(id);
        let current = read_json::<ApplicationRecord>(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| ReindexingError::ApplicationNotFound(id.clone()))?;
        let expected = ExpectedVersion::of(Some(&current));
        let mut record = current.value;
        record.active = false;

        let mut transaction = Transaction::new();
        transaction.put_json(&key, &record, expected)?;
        self.store.commit(transaction).await?;
        info!(application = %id, "Deactivated application");
        Ok(record)
    }

    /// Removes an application and its reindexing status. Returns false if it did not exist.
    pub async fn delete(&self, id: &ApplicationId) -> Result<bool, ReindexingError> {
        let lock = self.lock(id.tenant()).await?;
        let key = application_key(id);
        let Some(current) = self.store.read(&key).await? else {
            return Ok(false);
        };

        let mut transaction = Transaction::new();
        transaction.delete(&key, ExpectedVersion::of(Some(&current)));
        self.reindexing
            .stage_delete(id, &lock, &mut transaction)
            .await?;
        self.store.commit(transaction).await?;
        info!(application = %id, "Deleted application");
        Ok(true)
    }

    async fn stage_tenant(&self, tenant: &TenantName, transaction: &mut Transaction) -> Result<bool, ReindexingError> {
        let key = tenant_key(tenant);
        if self.store.read(&key).await?.is_some() {
            return Ok(false);
        }
        let record = TenantRecord {
            name: tenant.clone(),
            created_at: self.clock.now(),
        };
        transaction.put_json(key, &record, ExpectedVersion::Absent)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use fleet_coordination::{LockStats, MemoryLeases, MemoryStore};
    use fleet_reconcile::ManualClock;

    use super::*;

    fn repository() -> (TenantRepository, Arc<ManualClock>) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let locks = Arc::new(LockManager::new(Arc::new(MemoryLeases::new()), LockStats::new()));
        let repository = TenantRepository::new(
            Arc::new(MemoryStore::new()),
            locks,
            clock.clone(),
            Duration::from_secs(1),
        );
        (repository, clock)
    }

    fn id(tenant: &str, application: &str) -> ApplicationId {
        ApplicationId::from_parts(tenant, application, "default").unwrap()
    }

    fn music(tenant: &str) -> ApplicationRecord {
        ApplicationRecord::new(id(tenant, "music")).with_cluster("content", ["album", "artist"])
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_document_type_selection() {
        let record = music("tenant1").with_cluster("books", ["book", "album"]);
        let pairs = |clusters: &[&str], types: &[&str]| record.document_types(&names(clusters), &names(types));

        assert_eq!(pairs(&[], &[]).unwrap().len(), 4);
        assert_eq!(
            pairs(&["content"], &[]).unwrap(),
            vec![
                ("content".to_string(), "album".to_string()),
                ("content".to_string(), "artist".to_string())
            ]
        );
        assert_eq!(
            pairs(&[], &["album"]).unwrap(),
            vec![
                ("books".to_string(), "album".to_string()),
                ("content".to_string(), "album".to_string())
            ]
        );
        assert_eq!(pairs(&[], &["book", "artist"]).unwrap().len(), 2);
        assert!(matches!(
            pairs(&["search"], &[]),
            Err(ReindexingError::UnknownCluster { .. })
        ));
        assert!(matches!(
            pairs(&["content"], &["book"]),
            Err(ReindexingError::UnknownDocumentType { .. })
        ));
    }

    #[tokio::test]
    async fn test_deploy_bumps_generation_and_creates_status() {
        let (repository, clock) = repository();

        let first = repository.deploy(music("tenant1"), &[]).await.unwrap();
        assert_eq!(first.generation, 1);
        let status = repository.reindexing().find(&first.id).await.unwrap().unwrap();
        assert_eq!(status.common().ready(), clock.now());
        assert!(!status.has_pending());

        clock.advance(chrono::Duration::hours(1));
        let second = repository
            .deploy(music("tenant1"), &[ReindexAction::new("content", "album")])
            .await
            .unwrap();
        assert_eq!(second.generation, 2);

        let status = repository.reindexing().find(&second.id).await.unwrap().unwrap();
        assert_eq!(status.pending().collect::<Vec<_>>(), vec![("content", "album", 2)]);
        // The status is created once; later deployments leave its common readiness alone.
        assert_eq!(status.common().ready(), clock.now() - chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn test_deploy_rejects_unknown_document_type() {
        let (repository, _) = repository();
        let err = repository
            .deploy(music("tenant1"), &[ReindexAction::new("content", "track")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReindexingError::UnknownDocumentType { .. }));

        let err = repository
            .deploy(music("tenant1"), &[ReindexAction::new("search", "album")])
            .await
            .unwrap_err();
        assert!(matches!(err, ReindexingError::UnknownCluster { .. }));
        assert!(repository.tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tenants_and_active_applications() {
        let (repository, _) = repository();
        assert!(repository.add_tenant(&"empty".parse().unwrap()).await.unwrap());
        assert!(!repository.add_tenant(&"empty".parse().unwrap()).await.unwrap());
        repository.deploy(music("tenant1"), &[]).await.unwrap();
        repository
            .deploy(ApplicationRecord::new(id("tenant1", "books")), &[])
            .await
            .unwrap();
        repository.deactivate(&id("tenant1", "books")).await.unwrap();

        let tenants: Vec<String> = repository
            .tenants()
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(tenants, vec!["empty", "tenant1"]);

        let tenant1 = "tenant1".parse().unwrap();
        assert_eq!(repository.applications(&tenant1).await.unwrap().len(), 2);
        let active = repository.active_applications(&tenant1).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, id("tenant1", "music"));
    }

    #[tokio::test]
    async fn test_delete_removes_status() {
        let (repository, _) = repository();
        repository.deploy(music("tenant1"), &[]).await.unwrap();

        assert!(repository.delete(&id("tenant1", "music")).await.unwrap());
        assert!(repository.application(&id("tenant1", "music")).await.unwrap().is_none());
        assert!(repository
            .reindexing()
            .find(&id("tenant1", "music"))
            .await
            .unwrap()
            .is_none());
        assert!(!repository.delete(&id("tenant1", "music")).await.unwrap());
    }
}
