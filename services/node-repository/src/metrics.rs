//! Fleet metrics.
//!
//! [`MetricsReporter`] periodically publishes node counts per state,
//! per-node status flags, host capacity and lock statistics to a
//! [`MetricSink`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use fleet_coordination::LockStats;
use fleet_reconcile::Maintainer;
use tracing::{debug, warn};

use crate::{CapacityReport, Node, NodeList, NodeRepository, NodeResources, NodeResult, NodeState, NodeType};

/// Metric dimensions, ordered by name.
pub type Dimensions = BTreeMap<String, String>;

/// Destination for gauge values.
pub trait MetricSink: Send + Sync {
    fn set(&self, name: &str, value: f64, dimensions: &Dimensions);
}

/// A sink that keeps the latest value of every gauge in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetric {
    values: Mutex<BTreeMap<(String, Dimensions), f64>>,
}

impl InMemoryMetric {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value reported for `name` with exactly `dimensions`.
    pub fn get(&self, name: &str, dimensions: &Dimensions) -> Option<f64> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(name.to_string(), dimensions.clone()))
            .copied()
    }

    /// The value reported for `name` without dimensions.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.get(name, &Dimensions::new())
    }

    /// Every value reported for `name`, whatever the dimensions.
    pub fn values(&self, name: &str) -> Vec<(Dimensions, f64)> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|((_, dims), value)| (dims.clone(), *value))
            .collect()
    }
}

impl MetricSink for InMemoryMetric {
    fn set(&self, name: &str, value: f64, dimensions: &Dimensions) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((name.to_string(), dimensions.clone()), value);
    }
}

/// A sink that emits every gauge as a debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetric;

impl MetricSink for LogMetric {
    fn set(&self, name: &str, value: f64, dimensions: &Dimensions) {
        debug!(metric = name, value, ?dimensions, "gauge");
    }
}

/// Publishes fleet metrics on each maintenance pass.
pub struct MetricsReporter {
    nodes: Arc<NodeRepository>,
    metric: Arc<dyn MetricSink>,
    lock_stats: Arc<LockStats>,
}

impl MetricsReporter {
    pub fn new(
        nodes: Arc<NodeRepository>,
        metric: Arc<dyn MetricSink>,
        lock_stats: Arc<LockStats>,
    ) -> Self {
        Self {
            nodes,
            metric,
            lock_stats,
        }
    }

    /// Reports everything once.
    pub async fn report(&self) -> NodeResult<()> {
        let nodes = self.nodes.list().await?;
        self.report_state_counts(&nodes);
        for node in nodes.iter() {
            self.report_node(node);
        }
        self.report_capacity(&CapacityReport::container_hosts(&nodes));
        self.report_locks();
        debug!(nodes = nodes.len(), "Reported fleet metrics");
        Ok(())
    }

    /// Tenant nodes per state, including states with no nodes.
    fn report_state_counts(&self, nodes: &NodeList) {
        let tenants = nodes.of_type(NodeType::Tenant);
        for state in NodeState::ALL {
            let count = tenants.iter().filter(|n| n.state() == state).count();
            self.metric.set(
                &format!("hosted.{state}Hosts"),
                count as f64,
                &Dimensions::new(),
            );
        }
    }

    fn report_node(&self, node: &Node) {
        let mut dimensions = Dimensions::new();
        dimensions.insert("host".into(), node.hostname().to_string());
        dimensions.insert("state".into(), node.state().to_string());
        if let Some(parent) = node.parent_hostname() {
            dimensions.insert("parentHostname".into(), parent.to_string());
        }
        if let Some(allocation) = node.allocation() {
            dimensions.extend(application_dimensions(&allocation.owner));
            let cluster = &allocation.membership.cluster;
            dimensions.insert("clusterId".into(), cluster.id.clone());
            dimensions.insert("clusterType".into(), cluster.cluster_type.as_str().into());
        }

        let status = node.status();
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        self.metric.set(
            "wantedRebootGeneration",
            status.reboot.wanted as f64,
            &dimensions,
        );
        self.metric.set(
            "currentRebootGeneration",
            status.reboot.current as f64,
            &dimensions,
        );
        self.metric
            .set("wantToReboot", flag(status.reboot.pending()), &dimensions);
        self.metric
            .set("wantToRetire", flag(status.want_to_retire), &dimensions);
        self.metric.set(
            "wantToDeprovision",
            flag(status.want_to_deprovision),
            &dimensions,
        );
        self.metric
            .set("failCount", status.fail_count as f64, &dimensions);
    }

    fn report_capacity(&self, report: &CapacityReport) {
        let none = Dimensions::new();
        self.set_resources("hosted.docker.totalCapacity", &report.total, &none);
        self.set_resources("hosted.docker.freeCapacity", &report.free, &none);
        for (owner, allocated) in &report.allocated {
            let dimensions = application_dimensions(owner);
            self.set_resources("hosted.docker.allocatedCapacity", allocated, &dimensions);
        }
    }

    fn set_resources(&self, prefix: &str, resources: &NodeResources, dimensions: &Dimensions) {
        self.metric
            .set(&format!("{prefix}Cpu"), resources.vcpu, dimensions);
        self.metric
            .set(&format!("{prefix}Mem"), resources.memory_gb, dimensions);
        self.metric
            .set(&format!("{prefix}Disk"), resources.disk_gb, dimensions);
    }

    fn report_locks(&self) {
        for (path, metrics) in self.lock_stats.snapshot() {
            let dimensions = Dimensions::from([("lockPath".to_string(), path)]);
            for (name, value) in metrics.named() {
                self.metric.set(name, value as f64, &dimensions);
            }
        }
    }
}

fn application_dimensions(owner: &fleet_id::ApplicationId) -> Dimensions {
    Dimensions::from([
        ("tenantName".to_string(), owner.tenant().to_string()),
        (
            "app".to_string(),
            format!("{}.{}", owner.application(), owner.instance()),
        ),
        ("applicationId".to_string(), owner.to_full_string()),
    ])
}

#[async_trait]
impl Maintainer for MetricsReporter {
    fn name(&self) -> &'static str {
        "MetricsReporter"
    }

    async fn maintain(&self) -> bool {
        match self.report().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to report fleet metrics");
                false
            }
        }
    }
}
