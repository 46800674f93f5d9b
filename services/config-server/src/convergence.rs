//! Config convergence of running services.
//!
//! A [`ConvergenceOracle`] reports the config generation a service is
//! running. The [`ConvergenceChecker`] combines the answers for the services
//! of an application: the oldest generation among them tells which pending
//! reindexing may start, and per-service answers back the
//! `/serviceconverge` endpoints.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_id::HostName;
use fleet_reconcile::ConvergenceStatus;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::tenant::ApplicationRecord;
use crate::ConvergenceError;

/// A running service of an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub host: HostName,
    pub port: u16,
    pub service_type: String,
    /// The service is on a node being retired.
    #[serde(default)]
    pub retiring: bool,
}

impl ServiceInstance {
    pub fn new(host: HostName, port: u16, service_type: &str) -> Self {
        Self {
            host,
            port,
            service_type: service_type.to_string(),
            retiring: false,
        }
    }

    pub fn retiring(mut self) -> Self {
        self.retiring = true;
        self
    }

    pub fn host_and_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Source of the config generation services are running.
#[async_trait]
pub trait ConvergenceOracle: Send + Sync {
    /// The config generation `service` currently runs.
    async fn config_generation(&self, service: &ServiceInstance) -> Result<i64, ConvergenceError>;

    /// Queries every service concurrently, each bounded by `timeout`.
    ///
    /// Fails if any service fails or does not answer in time.
    async fn service_config_generations(
        &self,
        services: &[ServiceInstance],
        timeout: Duration,
    ) -> Result<Vec<(ServiceInstance, i64)>, ConvergenceError> {
        let answers = join_all(
            services
                .iter()
                .map(|service| config_generation_within(self, service, timeout)),
        )
        .await;
        services
            .iter()
            .cloned()
            .zip(answers)
            .map(|(service, answer)| answer.map(|generation| (service, generation)))
            .collect()
    }
}

/// Asks `oracle` for the generation of one service, giving up after `timeout`.
pub async fn config_generation_within<O: ConvergenceOracle + ?Sized>(
    oracle: &O,
    service: &ServiceInstance,
    timeout: Duration,
) -> Result<i64, ConvergenceError> {
    tokio::time::timeout(timeout, oracle.config_generation(service))
        .await
        .map_err(|_| ConvergenceError::Timeout {
            service: service.host_and_port(),
            timeout,
        })?
}

/// Which services take part in deciding the oldest generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvergencePolicy {
    /// Services on retiring nodes are ignored.
    #[default]
    ExcludeRetiring,
    AllInstances,
}

impl ConvergencePolicy {
    pub fn includes(&self, service: &ServiceInstance) -> bool {
        match self {
            Self::ExcludeRetiring => !service.retiring,
            Self::AllInstances => true,
        }
    }
}

impl FromStr for ConvergencePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclude-retiring" => Ok(Self::ExcludeRetiring),
            "all-instances" => Ok(Self::AllInstances),
            other => Err(format!("unknown convergence policy '{other}'")),
        }
    }
}

/// Convergence of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConvergence {
    pub host: String,
    pub service_type: String,
    pub wanted_generation: i64,
    pub current_generation: Option<i64>,
    pub status: ConvergenceStatus,
    pub converged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Convergence of every service of an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConvergence {
    pub wanted_generation: i64,
    /// Oldest generation among the services that answered.
    pub current_generation: Option<i64>,
    pub converged: bool,
    pub services: Vec<ServiceConvergence>,
}

/// Combines oracle answers for the services of an application.
pub struct ConvergenceChecker {
    oracle: Arc<dyn ConvergenceOracle>,
    policy: ConvergencePolicy,
    timeout: Duration,
}

impl ConvergenceChecker {
    pub fn new(oracle: Arc<dyn ConvergenceOracle>, policy: ConvergencePolicy, timeout: Duration) -> Self {
        Self {
            oracle,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> ConvergencePolicy {
        self.policy
    }

    /// The oldest config generation among the services the policy includes.
    ///
    /// `None` when no service is included. Fails when any included service
    /// fails or times out, since the oldest generation is then unknown.
    #[instrument(skip_all, fields(services = services.len()))]
    pub async fn oldest_generation(&self, services: &[ServiceInstance]) -> Result<Option<i64>, ConvergenceError> {
        let included: Vec<ServiceInstance> = services
            .iter()
            .filter(|s| self.policy.includes(s))
            .cloned()
            .collect();
        if included.is_empty() {
            return Ok(None);
        }
        let generations = self
            .oracle
            .service_config_generations(&included, self.timeout)
            .await?;
        let oldest = generations.into_iter().map(|(_, g)| g).min();
        debug!(?oldest, "Found oldest config generation");
        Ok(oldest)
    }

    /// Convergence of the service at `host_and_port`.
    pub async fn check_service(
        &self,
        application: &ApplicationRecord,
        host_and_port: &str,
    ) -> Result<ServiceConvergence, ConvergenceError> {
        let service = application
            .service(host_and_port)
            .ok_or_else(|| ConvergenceError::UnknownService(host_and_port.to_string()))?;
        Ok(self.convergence_of(service, application.generation).await)
    }

    /// Convergence of every service of `application`. A service that fails
    /// to answer is reported with unknown status.
    pub async fn check_services(&self, application: &ApplicationRecord) -> ApplicationConvergence {
        let services = join_all(
            application
                .services
                .iter()
                .map(|s| self.convergence_of(s, application.generation)),
        )
        .await;
        let current_generation = services.iter().filter_map(|s| s.current_generation).min();
        let converged = services.iter().all(|s| s.converged);
        ApplicationConvergence {
            wanted_generation: application.generation,
            current_generation,
            converged,
            services,
        }
    }

    async fn convergence_of(&self, service: &ServiceInstance, wanted: i64) -> ServiceConvergence {
        let answer = config_generation_within(self.oracle.as_ref(), service, self.timeout).await;
        let (current, error) = match answer {
            Ok(generation) => (Some(generation), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let status = ConvergenceStatus::of(wanted, current);
        ServiceConvergence {
            host: service.host_and_port(),
            service_type: service.service_type.clone(),
            wanted_generation: wanted,
            current_generation: current,
            status,
            converged: status.is_converged(),
            error,
        }
    }
}

/// Reads config generations from the services' state API.
pub struct HttpConvergenceOracle {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StateConfigResponse {
    config: StateConfig,
}

#[derive(Debug, Deserialize)]
struct StateConfig {
    generation: i64,
}

impl HttpConvergenceOracle {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn url(service: &ServiceInstance) -> String {
        format!("http://{}/state/v1/config", service.host_and_port())
    }
}

#[async_trait]
impl ConvergenceOracle for HttpConvergenceOracle {
    async fn config_generation(&self, service: &ServiceInstance) -> Result<i64, ConvergenceError> {
        let request_error = |e: reqwest::Error| ConvergenceError::Request {
            service: service.host_and_port(),
            message: e.to_string(),
        };
        let response = self
            .client
            .get(Self::url(service))
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConvergenceError::InvalidResponse {
                service: service.host_and_port(),
                message: format!("status {status}"),
            });
        }

        let body: StateConfigResponse =
            response
                .json()
                .await
                .map_err(|e| ConvergenceError::InvalidResponse {
                    service: service.host_and_port(),
                    message: e.to_string(),
                })?;
        Ok(body.config.generation)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use fleet_id::ApplicationId;
    use rstest::rstest;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    /// Answers from a fixed table; unknown services never answer.
    struct FixedOracle {
        generations: HashMap<String, i64>,
        calls: AtomicU32,
    }

    impl FixedOracle {
        fn new(generations: &[(&ServiceInstance, i64)]) -> Arc<Self> {
            Arc::new(Self {
                generations: generations
                    .iter()
                    .map(|(s, g)| (s.host_and_port(), *g))
                    .collect(),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ConvergenceOracle for FixedOracle {
        async fn config_generation(&self, service: &ServiceInstance) -> Result<i64, ConvergenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.generations.get(&service.host_and_port()) {
                Some(generation) => Ok(*generation),
                None => std::future::pending().await,
            }
        }
    }

    fn service(host: &str) -> ServiceInstance {
        ServiceInstance::new(HostName::from(host).unwrap(), 19071, "searchnode")
    }

    fn checker(oracle: Arc<FixedOracle>, policy: ConvergencePolicy) -> ConvergenceChecker {
        ConvergenceChecker::new(oracle, policy, Duration::from_millis(50))
    }

    #[rstest]
    #[case::exclude_retiring(ConvergencePolicy::ExcludeRetiring, Some(5))]
    #[case::all_instances(ConvergencePolicy::AllInstances, Some(3))]
    #[tokio::test]
    async fn test_oldest_generation_by_policy(#[case] policy: ConvergencePolicy, #[case] expected: Option<i64>) {
        let a = service("host1");
        let b = service("host2");
        let retiring = service("host3").retiring();
        let oracle = FixedOracle::new(&[(&a, 6), (&b, 5), (&retiring, 3)]);

        let oldest = checker(oracle, policy)
            .oldest_generation(&[a, b, retiring])
            .await
            .unwrap();
        assert_eq!(oldest, expected);
    }

    #[tokio::test]
    async fn test_no_services_means_no_generation() {
        let oracle = FixedOracle::new(&[]);
        let retiring = service("host1").retiring();

        let checker = checker(oracle.clone(), ConvergencePolicy::ExcludeRetiring);
        assert_eq!(checker.oldest_generation(&[]).await.unwrap(), None);
        assert_eq!(checker.oldest_generation(&[retiring]).await.unwrap(), None);
        assert_eq!(oracle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unanswered_service_times_out() {
        let answering = service("host1");
        let silent = service("host2");
        let oracle = FixedOracle::new(&[(&answering, 4)]);

        let err = checker(oracle, ConvergencePolicy::AllInstances)
            .oldest_generation(&[answering, silent])
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::Timeout { ref service, .. } if service == "host2:19071"));
    }

    #[tokio::test]
    async fn test_check_services_reports_each_service() {
        let a = service("host1");
        let b = service("host2");
        let silent = service("host3");
        let oracle = FixedOracle::new(&[(&a, 3), (&b, 2)]);
        let mut application = ApplicationRecord::new(ApplicationId::from_parts("t", "a", "default").unwrap())
            .with_service(a)
            .with_service(b)
            .with_service(silent);
        application.generation = 3;
        let checker = checker(oracle, ConvergencePolicy::ExcludeRetiring);

        let convergence = checker.check_services(&application).await;
        assert!(!convergence.converged);
        assert_eq!(convergence.current_generation, Some(2));
        let statuses: Vec<ConvergenceStatus> = convergence.services.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![
                ConvergenceStatus::Converged,
                ConvergenceStatus::Converging,
                ConvergenceStatus::Unknown
            ]
        );
        assert!(convergence.services[2].error.is_some());

        let one = checker.check_service(&application, "host1:19071").await.unwrap();
        assert!(one.converged);
        let err = checker.check_service(&application, "host9:19071").await.unwrap_err();
        assert!(matches!(err, ConvergenceError::UnknownService(_)));
    }

    #[rstest]
    #[case("exclude-retiring", Ok(ConvergencePolicy::ExcludeRetiring))]
    #[case("all-instances", Ok(ConvergencePolicy::AllInstances))]
    #[case("everything", Err(()))]
    fn test_policy_from_str(#[case] input: &str, #[case] expected: Result<ConvergencePolicy, ()>) {
        assert_eq!(input.parse::<ConvergencePolicy>().map_err(|_| ()), expected);
    }

    fn local_service(server: &MockServer) -> ServiceInstance {
        let address = server.address();
        ServiceInstance::new(
            HostName::from(&address.ip().to_string()).unwrap(),
            address.port(),
            "container",
        )
    }

    #[tokio::test]
    async fn test_http_oracle_reads_state_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/state/v1/config"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"config": {"generation": 42}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let oracle = HttpConvergenceOracle::new(reqwest::Client::new());
        let generation = oracle.config_generation(&local_service(&server)).await.unwrap();
        assert_eq!(generation, 42);
    }

    #[rstest]
    #[case::server_error(ResponseTemplate::new(503))]
    #[case::missing_generation(ResponseTemplate::new(200).set_body_json(serde_json::json!({"config": {}})))]
    #[tokio::test]
    async fn test_http_oracle_rejects_bad_responses(#[case] response: ResponseTemplate) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/state/v1/config"))
            .respond_with(response)
            .mount(&server)
            .await;

        let oracle = HttpConvergenceOracle::new(reqwest::Client::new());
        let err = oracle
            .config_generation(&local_service(&server))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::InvalidResponse { .. }));
    }
}
