//! Node persistence in the coordination store.
//!
//! Each node is a JSON document under [`NODES_PATH`]. Writes are staged in
//! a [`NodeTransaction`] and only accepted when the caller holds the lock
//! guarding the node as currently persisted.

use std::sync::Arc;

use fleet_coordination::{
    read_json, ExpectedVersion, LockName, ScopedLock, Transaction, Versioned, VersionedStore,
};
use fleet_id::HostName;
use tracing::debug;

use crate::{Node, NodeError, NodeResult, NodeType};

/// Prefix of all node documents.
pub const NODES_PATH: &str = "/provision/v1/nodes/";

pub fn node_key(hostname: &HostName) -> String {
    format!("{NODES_PATH}{hostname}")
}

/// Lock guarding unallocated nodes of a given infrastructure type.
pub fn node_type_lock(node_type: NodeType) -> LockName {
    LockName::new(format!("/provision/v1/locks/{}Lock", node_type.as_str()))
}

/// The lock guarding writes to `node`.
///
/// Decided by the persisted node when there is one: an owned node is
/// guarded by its owner's tenant lock. Unowned tenant nodes share the
/// unallocated lock; other unowned nodes use their type lock.
pub fn required_lock(persisted: Option<&Node>, node: &Node) -> LockName {
    let basis = persisted.unwrap_or(node);
    match persisted.and_then(Node::owner) {
        Some(owner) => LockName::tenant(owner.tenant()),
        None if basis.node_type() == NodeType::Tenant => LockName::unallocated(),
        None => node_type_lock(basis.node_type()),
    }
}

/// Node writes to be committed together.
///
/// Other writes that must land atomically with the nodes can be added
/// through [`NodeTransaction::transaction_mut`].
#[derive(Debug, Default)]
pub struct NodeTransaction {
    inner: Transaction,
    nodes: Vec<Node>,
}

impl NodeTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_mut(&mut self) -> &mut Transaction {
        &mut self.inner
    }

    /// Nodes staged so far, as they will be written.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Moves everything staged in `other` into this transaction.
    pub fn append(&mut self, other: NodeTransaction) {
        self.inner.append(other.inner);
        self.nodes.extend(other.nodes);
    }
}

/// Reads and writes nodes.
#[derive(Clone)]
pub struct NodeStore {
    store: Arc<dyn VersionedStore>,
}

impl NodeStore {
    pub fn new(store: Arc<dyn VersionedStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self, hostname: &HostName) -> NodeResult<Option<Versioned<Node>>> {
        Ok(read_json(self.store.as_ref(), &node_key(hostname)).await?)
    }

    /// Reads every node, ordered by hostname.
    pub async fn read_all(&self) -> NodeResult<Vec<Versioned<Node>>> {
        let keys = self.store.list(NODES_PATH).await?;
        let mut nodes = Vec::with_capacity(keys.len());
        for key in keys {
            // A node removed between list and read is simply skipped.
            if let Some(node) = read_json(self.store.as_ref(), &key).await? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// Stages a write of `node` over `current`, the version read by the caller.
    ///
    /// Fails without staging anything if none of `locks` is the lock
    /// guarding the node.
    pub fn stage(
        &self,
        transaction: &mut NodeTransaction,
        current: Option<&Versioned<Node>>,
        node: Node,
        locks: &[&ScopedLock],
    ) -> NodeResult<()> {
        let required = required_lock(current.map(|c| &c.value), &node);
        if !locks.iter().any(|lock| lock.is_for(&required)) {
            return Err(NodeError::LockNotHeld {
                hostname: node.hostname().clone(),
                required: required.to_string(),
            });
        }

        transaction.inner.put_json(
            node_key(node.hostname()),
            &node,
            ExpectedVersion::of(current),
        )?;
        transaction.nodes.push(node);
        Ok(())
    }

    /// Commits all staged writes, or none of them.
    pub async fn commit(&self, transaction: NodeTransaction) -> NodeResult<Vec<Node>> {
        let NodeTransaction { inner, nodes } = transaction;
        if inner.is_empty() {
            return Ok(nodes);
        }
        let writes = inner.len();
        self.store.commit(inner).await?;
        debug!(writes, nodes = nodes.len(), "Committed node transaction");
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use fleet_coordination::{LockManager, LockStats, MemoryLeases, MemoryStore};
    use fleet_id::ApplicationId;

    use super::*;
    use crate::{Allocation, Flavor, IpConfig, NodeResources};

    fn tenant_node(name: &str) -> Node {
        Node::create(
            name,
            IpConfig::default(),
            HostName::from(name).unwrap(),
            Flavor::new("small", NodeResources::new(2.0, 8.0, 50.0, 1.0)),
            NodeType::Tenant,
        )
    }

    fn allocated(node: Node) -> Node {
        let owner = ApplicationId::from_parts("tenant1", "app1", "default").unwrap();
        node.with_allocation(Allocation::new(
            owner,
            "container/id1/0".parse().unwrap(),
            NodeResources::new(1.0, 4.0, 20.0, 1.0),
        ))
        .unwrap()
    }

    fn setup() -> (Arc<MemoryStore>, NodeStore, LockManager) {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(Arc::new(MemoryLeases::new()), LockStats::new());
        (store.clone(), NodeStore::new(store), locks)
    }

    #[test]
    fn test_required_lock() {
        let node = tenant_node("node1");
        assert_eq!(required_lock(None, &node), LockName::unallocated());

        let owned = allocated(node.clone());
        assert_eq!(required_lock(None, &owned), LockName::unallocated());
        assert_eq!(
            required_lock(Some(&owned), &node),
            LockName::new("/config/v2/locks/tenant1")
        );

        let host = Node::create(
            "host1",
            IpConfig::default(),
            HostName::from("host1").unwrap(),
            Flavor::new("large", NodeResources::new(8.0, 64.0, 500.0, 10.0)),
            NodeType::Host,
        );
        assert_eq!(
            required_lock(None, &host),
            LockName::new("/provision/v1/locks/hostLock")
        );
    }

    #[tokio::test]
    async fn test_stage_requires_lock() {
        let (_, db, locks) = setup();
        let wrong = locks
            .acquire(&LockName::new("/some/other/lock"), Duration::from_secs(1))
            .await
            .unwrap();

        let mut transaction = NodeTransaction::new();
        let err = db
            .stage(&mut transaction, None, tenant_node("node1"), &[&wrong])
            .unwrap_err();
        assert!(matches!(err, NodeError::LockNotHeld { .. }));
        assert!(transaction.is_empty());
    }

    #[tokio::test]
    async fn test_commit_is_all_or_nothing() {
        let (store, db, locks) = setup();
        let lock = locks
            .acquire(&LockName::unallocated(), Duration::from_secs(1))
            .await
            .unwrap();

        let mut transaction = NodeTransaction::new();
        for name in ["node1", "node2", "node3"] {
            db.stage(&mut transaction, None, tenant_node(name), &[&lock])
                .unwrap();
        }
        store.fail_next_commit_touching(node_key(&HostName::from("node2").unwrap()));
        assert!(db.commit(transaction).await.is_err());
        assert!(db.read_all().await.unwrap().is_empty());

        let mut transaction = NodeTransaction::new();
        for name in ["node1", "node2", "node3"] {
            db.stage(&mut transaction, None, tenant_node(name), &[&lock])
                .unwrap();
        }
        let written = db.commit(transaction).await.unwrap();
        assert_eq!(written.len(), 3);

        let all = db.read_all().await.unwrap();
        let names: Vec<&str> = all.iter().map(|n| n.value.hostname().value()).collect();
        assert_eq!(names, vec!["node1", "node2", "node3"]);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (_, db, locks) = setup();
        let lock = locks
            .acquire(&LockName::unallocated(), Duration::from_secs(1))
            .await
            .unwrap();

        let mut transaction = NodeTransaction::new();
        db.stage(&mut transaction, None, tenant_node("node1"), &[&lock])
            .unwrap();
        db.commit(transaction).await.unwrap();

        // Staged against "absent", but the node now exists.
        let mut transaction = NodeTransaction::new();
        db.stage(&mut transaction, None, tenant_node("node1"), &[&lock])
            .unwrap();
        let err = db.commit(transaction).await.unwrap_err();
        assert!(matches!(err, NodeError::Coordination(ref e) if e.is_conflict()));
    }
}
