//! Host capacity accounting.
//!
//! Capacity is counted over hosts that can take children (ready or active
//! hosts). A child consumes capacity on its host while it holds an
//! allocation in reserved or active; in any other state its share counts
//! as free. Bare metal tenant nodes count as a whole: free while ready,
//! allocated while reserved or active.

use std::collections::{BTreeMap, HashMap};

use fleet_id::{ApplicationId, HostName};
use serde::Serialize;

use crate::{Node, NodeList, NodeResources, NodeState, NodeType};

/// Total, free and allocated capacity across container hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReport {
    pub total: NodeResources,
    pub free: NodeResources,
    /// Capacity consumed by each application.
    pub allocated: BTreeMap<ApplicationId, NodeResources>,
}

impl CapacityReport {
    /// Capacity of container hosts and bare metal tenant nodes together.
    pub fn compute(nodes: &NodeList) -> Self {
        let mut report = Self::container_hosts(nodes);
        for node in nodes.iter().filter(|n| is_bare_tenant(n)) {
            if node.state() == NodeState::Ready {
                report.total = report.total + *node.resources();
                report.free = report.free + *node.resources();
            } else if let Some(owner) = consumer(node) {
                report.total = report.total + *node.resources();
                let allocated = report.allocated.entry(owner.clone()).or_default();
                *allocated = *allocated + *node.resources();
            }
        }
        report
    }

    /// Capacity of container hosts only, as shared out to their children.
    pub fn container_hosts(nodes: &NodeList) -> Self {
        let mut children: HashMap<&HostName, Vec<&Node>> = HashMap::new();
        for node in nodes.iter() {
            if let Some(parent) = node.parent_hostname() {
                children.entry(parent).or_default().push(node);
            }
        }

        let mut report = Self::default();
        for host in nodes.iter().filter(|n| provides_capacity(n)) {
            let mut used = NodeResources::ZERO;
            for child in children.get(host.hostname()).into_iter().flatten() {
                let Some(owner) = consumer(child) else {
                    continue;
                };
                used = used + *child.resources();
                let allocated = report.allocated.entry(owner.clone()).or_default();
                *allocated = *allocated + *child.resources();
            }
            report.total = report.total + *host.resources();
            report.free = report.free + (*host.resources() - used);
        }
        report
    }

    /// Sum of all allocated capacity.
    pub fn allocated_total(&self) -> NodeResources {
        self.allocated.values().copied().sum()
    }
}

fn provides_capacity(node: &Node) -> bool {
    node.node_type().is_host() && matches!(node.state(), NodeState::Ready | NodeState::Active)
}

fn is_bare_tenant(node: &Node) -> bool {
    node.node_type() == NodeType::Tenant && !node.is_child()
}

/// The application a node's capacity is counted against, if any.
fn consumer(child: &Node) -> Option<&ApplicationId> {
    match child.state() {
        NodeState::Reserved | NodeState::Active => child.owner(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::{Agent, Allocation, Flavor, IpConfig};

    fn host(name: &str, state: NodeState) -> Node {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        Node::create(
            name,
            IpConfig::default(),
            HostName::from(name).unwrap(),
            Flavor::new("host", NodeResources::new(64.0, 256.0, 2000.0, 25.0)),
            NodeType::Host,
        )
        .created(state, Agent::System, at)
    }

    fn child(index: usize, parent: &str, app: usize, state: NodeState, r: NodeResources) -> Node {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let owner = ApplicationId::from_parts(&format!("tenant{app}"), "app", "default").unwrap();
        let node = Node::create_container(
            std::iter::empty::<std::net::IpAddr>(),
            HostName::from(&format!("{parent}-child{index}")).unwrap(),
            HostName::from(parent).unwrap(),
            r,
        )
        .with_allocation(Allocation::new(
            owner,
            format!("container/c/{index}").parse().unwrap(),
            r,
        ))
        .unwrap();
        node.created(state, Agent::Application, at)
    }

    #[test]
    fn test_only_ready_and_active_hosts_count() {
        let nodes = NodeList::new(vec![
            host("host1", NodeState::Active),
            host("host2", NodeState::Ready),
            host("host3", NodeState::Failed),
            host("host4", NodeState::Provisioned),
        ]);
        let report = CapacityReport::compute(&nodes);
        assert!(report
            .total
            .approx_eq(&NodeResources::new(128.0, 512.0, 4000.0, 50.0)));
        assert!(report.free.approx_eq(&report.total));
        assert!(report.allocated.is_empty());
    }

    #[test]
    fn test_inactive_children_do_not_consume() {
        let r = NodeResources::new(4.0, 16.0, 100.0, 1.0);
        let nodes = NodeList::new(vec![
            host("host1", NodeState::Active),
            child(0, "host1", 1, NodeState::Active, r),
            child(1, "host1", 1, NodeState::Inactive, r),
            child(2, "host1", 2, NodeState::Reserved, r),
        ]);
        let report = CapacityReport::compute(&nodes);
        assert!(report
            .free
            .approx_eq(&NodeResources::new(56.0, 224.0, 1800.0, 23.0)));
        assert_eq!(report.allocated.len(), 2);
    }

    #[test]
    fn test_bare_tenant_nodes_count_whole() {
        let at = Utc.timestamp_opt(0, 0).unwrap();
        let bare = |name: &str| {
            Node::create(
                name,
                IpConfig::default(),
                HostName::from(name).unwrap(),
                Flavor::new("bare", NodeResources::new(8.0, 32.0, 500.0, 1.0)),
                NodeType::Tenant,
            )
        };
        let owner = ApplicationId::from_parts("tenant1", "app", "default").unwrap();
        let allocated = bare("bare2")
            .with_allocation(Allocation::new(
                owner.clone(),
                "content/c/0".parse().unwrap(),
                NodeResources::new(4.0, 16.0, 100.0, 1.0),
            ))
            .unwrap()
            .created(NodeState::Active, Agent::Application, at);
        let nodes = NodeList::new(vec![
            bare("bare1").created(NodeState::Ready, Agent::System, at),
            allocated,
            bare("bare3").created(NodeState::Dirty, Agent::System, at),
        ]);

        let report = CapacityReport::compute(&nodes);
        assert!(report
            .total
            .approx_eq(&NodeResources::new(16.0, 64.0, 1000.0, 2.0)));
        assert!(report
            .free
            .approx_eq(&NodeResources::new(8.0, 32.0, 500.0, 1.0)));
        assert!(report.allocated[&owner].approx_eq(&NodeResources::new(8.0, 32.0, 500.0, 1.0)));

        let hosts = CapacityReport::container_hosts(&nodes);
        assert_eq!(hosts, CapacityReport::default());
    }

    fn state() -> impl Strategy<Value = NodeState> {
        prop::sample::select(NodeState::ALL.to_vec())
    }

    fn resources() -> impl Strategy<Value = NodeResources> {
        (1u32..8, 1u32..32, 1u32..200).prop_map(|(cpu, mem, disk)| {
            NodeResources::new(cpu as f64 * 0.5, mem as f64, disk as f64, 1.0)
        })
    }

    proptest! {
        #[test]
        fn prop_free_is_total_minus_allocated(
            hosts in prop::collection::vec(state(), 1..4),
            children in prop::collection::vec((0usize..4, 0usize..3, state(), resources()), 0..20),
        ) {
            let mut nodes: Vec<Node> = hosts
                .iter()
                .enumerate()
                .map(|(i, s)| host(&format!("host{i}"), *s))
                .collect();
            for (index, (parent, app, s, r)) in children.into_iter().enumerate() {
                let parent = format!("host{}", parent % hosts.len());
                nodes.push(child(index, &parent, app, s, r));
            }

            let report = CapacityReport::compute(&NodeList::new(nodes));
            let expected = report.total - report.allocated_total();
            prop_assert!(report.free.approx_eq(&expected), "{} != {}", report.free, expected);
        }
    }
}
