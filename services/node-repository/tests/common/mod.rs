//! Shared fixtures for node repository tests.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fleet_coordination::{LockManager, LockStats, MemoryLeases, MemoryStore};
use fleet_id::{ApplicationId, HostName};
use fleet_node_repository::{
    Agent, Allocation, Flavor, IpConfig, Node, NodeRepository, NodeRepositoryConfig,
    NodeResources, NodeTransaction, NodeType,
};
use fleet_reconcile::ManualClock;

pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub stats: Arc<LockStats>,
    pub clock: Arc<ManualClock>,
    pub nodes: Arc<NodeRepository>,
}

pub fn fleet() -> Fleet {
    fleet_with_lock_timeout(Duration::from_secs(5))
}

pub fn fleet_with_lock_timeout(lock_timeout: Duration) -> Fleet {
    let store = Arc::new(MemoryStore::new());
    let stats = LockStats::new();
    let locks = Arc::new(LockManager::new(Arc::new(MemoryLeases::new()), stats.clone()));
    let clock = ManualClock::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    let nodes = Arc::new(NodeRepository::new(
        store.clone(),
        locks,
        clock.clone(),
        NodeRepositoryConfig { lock_timeout },
    ));
    Fleet {
        store,
        stats,
        clock,
        nodes,
    }
}

pub fn hostname(name: &str) -> HostName {
    HostName::from(name).unwrap()
}

pub fn ip(address: &str) -> IpAddr {
    address.parse().unwrap()
}

pub fn app(tenant: &str, application: &str) -> ApplicationId {
    ApplicationId::from_parts(tenant, application, "default").unwrap()
}

pub fn docker_host(name: &str) -> Node {
    Node::create(
        name,
        IpConfig::new([ip("::1")], ["::2", "::3", "::4", "::5"].map(ip)),
        hostname(name),
        Flavor::new("host", NodeResources::new(7.0, 100.0, 120.0, 10.0)),
        NodeType::Host,
    )
}

pub fn bare_node(name: &str) -> Node {
    Node::create(
        name,
        IpConfig::default(),
        hostname(name),
        Flavor::new("default", NodeResources::new(2.0, 16.0, 400.0, 1.0)),
        NodeType::Tenant,
    )
}

pub fn container(
    name: &str,
    parent: &str,
    address: &str,
    owner: ApplicationId,
    resources: NodeResources,
) -> Node {
    Node::create_container([ip(address)], hostname(name), hostname(parent), resources)
        .with_allocation(Allocation::new(
            owner,
            "container/id1/0/3".parse().unwrap(),
            resources,
        ))
        .unwrap()
}

pub fn allocation(owner: ApplicationId, index: u32) -> Allocation {
    Allocation::new(
        owner,
        format!("content/search/0/{index}").parse().unwrap(),
        NodeResources::new(2.0, 16.0, 400.0, 1.0),
    )
}

/// Adds nodes and brings them to ready.
pub async fn add_ready(fleet: &Fleet, nodes: Vec<Node>) {
    let added = fleet.nodes.add_nodes(nodes).await.unwrap();
    for node in added {
        fleet
            .nodes
            .dirty_recursively(node.hostname(), Agent::System, "provisioned")
            .await
            .unwrap();
        fleet
            .nodes
            .set_ready(node.hostname(), Agent::System, "cleaned")
            .await
            .unwrap();
    }
}

/// Adds a docker host with two reserved containers of different tenants.
pub async fn docker_fleet(fleet: &Fleet) {
    add_ready(fleet, vec![docker_host("host")]).await;
    let host = fleet.nodes.node(&hostname("host")).await.unwrap().unwrap();
    {
        let lock = fleet.nodes.lock_node_type(NodeType::Host).await.unwrap();
        let mut transaction = NodeTransaction::new();
        fleet
            .nodes
            .activate(&[host], &mut transaction, &[&lock])
            .await
            .unwrap();
        fleet.nodes.commit(transaction).await.unwrap();
    }

    fleet
        .nodes
        .add_container_nodes(vec![
            container(
                "container1",
                "host",
                "::2",
                app("tenant1", "app1"),
                NodeResources::new(1.0, 3.0, 2.0, 1.0),
            ),
            container(
                "container2",
                "host",
                "::3",
                app("tenant2", "app2"),
                NodeResources::new(2.0, 4.0, 4.0, 1.0),
            ),
        ])
        .await
        .unwrap();
}
