//! Shared harness for config server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fleet_config_server::convergence::{
    ConvergenceChecker, ConvergenceOracle, ConvergencePolicy, ServiceInstance,
};
use fleet_config_server::maintenance::{ReindexingMaintainer, ReindexingMaintainerConfig};
use fleet_config_server::tenant::{ApplicationRecord, ReindexAction, TenantRepository};
use fleet_config_server::ConvergenceError;
use fleet_coordination::{LockManager, LockStats, MemoryLeases, MemoryStore};
use fleet_id::{ApplicationId, HostName};
use fleet_reconcile::ManualClock;

/// What a service answers when asked for its config generation.
#[derive(Debug, Clone, Copy)]
pub enum Answer {
    Generation(i64),
    Fail,
    /// Never answers.
    Hang,
}

/// Oracle answering from a table that tests change as they go.
#[derive(Default)]
pub struct ScriptedOracle {
    answers: Mutex<HashMap<String, Answer>>,
    calls: AtomicU32,
}

impl ScriptedOracle {
    pub fn set(&self, service: &ServiceInstance, answer: Answer) {
        self.answers
            .lock()
            .unwrap()
            .insert(service.host_and_port(), answer);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConvergenceOracle for ScriptedOracle {
    async fn config_generation(&self, service: &ServiceInstance) -> Result<i64, ConvergenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(&service.host_and_port())
            .copied()
            .unwrap_or(Answer::Hang);
        match answer {
            Answer::Generation(generation) => Ok(generation),
            Answer::Fail => Err(ConvergenceError::Request {
                service: service.host_and_port(),
                message: "connection refused".to_string(),
            }),
            Answer::Hang => std::future::pending().await,
        }
    }
}

pub struct ConfigServer {
    pub store: Arc<MemoryStore>,
    pub locks: Arc<LockManager>,
    pub clock: Arc<ManualClock>,
    pub oracle: Arc<ScriptedOracle>,
    pub tenants: Arc<TenantRepository>,
    pub convergence: Arc<ConvergenceChecker>,
    pub maintainer: Arc<ReindexingMaintainer>,
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn config_server() -> ConfigServer {
    config_server_with_lock_timeout(Duration::from_secs(5))
}

pub fn config_server_with_lock_timeout(lock_timeout: Duration) -> ConfigServer {
    let store = Arc::new(MemoryStore::new());
    let locks = Arc::new(LockManager::new(Arc::new(MemoryLeases::new()), LockStats::new()));
    let clock = ManualClock::at(t0());
    let oracle = Arc::new(ScriptedOracle::default());
    let tenants = Arc::new(TenantRepository::new(
        store.clone(),
        locks.clone(),
        clock.clone(),
        lock_timeout,
    ));
    let convergence = Arc::new(ConvergenceChecker::new(
        oracle.clone(),
        ConvergencePolicy::ExcludeRetiring,
        Duration::from_millis(100),
    ));
    let maintainer = Arc::new(ReindexingMaintainer::new(
        tenants.clone(),
        convergence.clone(),
        clock.clone(),
        ReindexingMaintainerConfig::default(),
    ));
    ConfigServer {
        store,
        locks,
        clock,
        oracle,
        tenants,
        convergence,
        maintainer,
    }
}

pub fn app(tenant: &str, application: &str) -> ApplicationId {
    ApplicationId::from_parts(tenant, application, "default").unwrap()
}

pub fn service(host: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(HostName::from(host).unwrap(), port, "searchnode")
}

/// An application with one content cluster and one service per host.
pub fn music(id: ApplicationId, hosts: &[&str]) -> ApplicationRecord {
    hosts.iter().fold(
        ApplicationRecord::new(id).with_cluster("content", ["album", "artist"]),
        |record, host| record.with_service(service(host, 19100)),
    )
}

pub async fn deploy(server: &ConfigServer, record: ApplicationRecord, reindex: &[(&str, &str)]) -> ApplicationRecord {
    let actions: Vec<ReindexAction> = reindex
        .iter()
        .map(|(cluster, document_type)| ReindexAction::new(cluster, document_type))
        .collect();
    server.tenants.deploy(record, &actions).await.unwrap()
}
