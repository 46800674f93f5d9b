//! Node repository operations.
//!
//! Every mutation reads the nodes it changes under the lock that guards
//! them, validates all changes before writing any, and commits them in a
//! single transaction.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_coordination::{LockError, LockManager, LockName, ScopedLock, Versioned, VersionedStore};
use fleet_id::{HostName, TenantName};
use fleet_reconcile::Clock;
use tracing::{debug, info, instrument};

use crate::db::{node_type_lock, required_lock};
use crate::{
    Agent, Allocation, CapacityReport, IpConfig, Node, NodeError, NodeList, NodeResult,
    NodeState, NodeStore, NodeTransaction, NodeType,
};

/// Times a node is re-locked when its owner changes while locking.
const LOCK_NODE_ATTEMPTS: u32 = 3;

/// Node repository settings.
#[derive(Debug, Clone)]
pub struct NodeRepositoryConfig {
    /// Maximum time to wait for any single lock.
    pub lock_timeout: Duration,
}

impl Default for NodeRepositoryConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
        }
    }
}

/// The node repository.
pub struct NodeRepository {
    db: NodeStore,
    locks: Arc<LockManager>,
    clock: Arc<dyn Clock>,
    config: NodeRepositoryConfig,
}

impl NodeRepository {
    pub fn new(
        store: Arc<dyn VersionedStore>,
        locks: Arc<LockManager>,
        clock: Arc<dyn Clock>,
        config: NodeRepositoryConfig,
    ) -> Self {
        Self {
            db: NodeStore::new(store),
            locks,
            clock,
            config,
        }
    }

    pub fn db(&self) -> &NodeStore {
        &self.db
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Locks the pool of unallocated tenant nodes.
    pub async fn lock_unallocated(&self) -> NodeResult<ScopedLock> {
        self.lock(&LockName::unallocated()).await
    }

    /// Locks everything owned by `tenant`.
    pub async fn lock_tenant(&self, tenant: &TenantName) -> NodeResult<ScopedLock> {
        self.lock(&LockName::tenant(tenant)).await
    }

    /// Locks unallocated nodes of an infrastructure type.
    pub async fn lock_node_type(&self, node_type: NodeType) -> NodeResult<ScopedLock> {
        self.lock(&node_type_lock(node_type)).await
    }

    async fn lock(&self, name: &LockName) -> NodeResult<ScopedLock> {
        Ok(self.locks.acquire(name, self.config.lock_timeout).await?)
    }

    /// Acquires all `names` in sorted order.
    async fn lock_all(&self, names: BTreeSet<LockName>) -> NodeResult<Vec<ScopedLock>> {
        let mut held = Vec::with_capacity(names.len());
        for name in &names {
            held.push(self.lock(name).await?);
        }
        Ok(held)
    }

    /// Locks the scope of one node and reads it under that lock.
    async fn lock_node(&self, hostname: &HostName) -> NodeResult<(ScopedLock, Versioned<Node>)> {
        let mut required = LockName::unallocated();
        for attempt in 1..=LOCK_NODE_ATTEMPTS {
            let node = self.require(hostname).await?;
            required = required_lock(Some(&node.value), &node.value);
            let lock = self.lock(&required).await?;

            let current = self.require(hostname).await?;
            if required_lock(Some(&current.value), &current.value) == required {
                return Ok((lock, current));
            }
            debug!(%hostname, attempt, "Node changed owner while locking, retrying");
        }
        Err(LockError::Timeout {
            name: required.to_string(),
            timeout: self.config.lock_timeout,
        }
        .into())
    }

    async fn require(&self, hostname: &HostName) -> NodeResult<Versioned<Node>> {
        self.db
            .read(hostname)
            .await?
            .ok_or_else(|| NodeError::NotFound(hostname.clone()))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn node(&self, hostname: &HostName) -> NodeResult<Option<Node>> {
        Ok(self.db.read(hostname).await?.map(|v| v.value))
    }

    /// All nodes, ordered by hostname.
    pub async fn list(&self) -> NodeResult<NodeList> {
        let nodes = self.db.read_all().await?;
        Ok(NodeList::new(nodes.into_iter().map(|v| v.value).collect()))
    }

    pub async fn nodes_of_type(&self, node_type: NodeType) -> NodeResult<NodeList> {
        Ok(self.list().await?.of_type(node_type))
    }

    pub async fn children_of(&self, parent: &HostName) -> NodeResult<NodeList> {
        Ok(self.list().await?.children_of(parent))
    }

    /// Addresses in the host's pool not used by any of its children.
    pub async fn free_ip_addresses(&self, host: &HostName) -> NodeResult<BTreeSet<IpAddr>> {
        let nodes = self.list().await?;
        let host = nodes
            .node(host)
            .ok_or_else(|| NodeError::NotFound(host.clone()))?;
        Ok(free_addresses(host, &nodes))
    }

    pub async fn capacity(&self) -> NodeResult<CapacityReport> {
        Ok(CapacityReport::compute(&self.list().await?))
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Adds new nodes in state provisioned.
    #[instrument(skip_all, fields(count = nodes.len()))]
    pub async fn add_nodes(&self, nodes: Vec<Node>) -> NodeResult<Vec<Node>> {
        let now = self.clock.now();
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if !seen.insert(node.hostname().clone()) || self.db.read(node.hostname()).await?.is_some()
            {
                return Err(NodeError::AlreadyExists(node.hostname().clone()));
            }
        }

        let names = nodes.iter().map(|n| required_lock(None, n)).collect();
        let locks = self.lock_all(names).await?;
        let held: Vec<&ScopedLock> = locks.iter().collect();

        let mut transaction = NodeTransaction::new();
        for node in nodes {
            let node = node.created(NodeState::Provisioned, Agent::System, now);
            self.db.stage(&mut transaction, None, node, &held)?;
        }
        let added = self.db.commit(transaction).await?;
        info!(count = added.len(), "Added nodes");
        Ok(added)
    }

    /// Adds allocated containers directly in state reserved.
    ///
    /// Each container must name an existing host as parent, and its
    /// addresses must come from that host's free pool.
    #[instrument(skip_all, fields(count = nodes.len()))]
    pub async fn add_container_nodes(&self, nodes: Vec<Node>) -> NodeResult<Vec<Node>> {
        let now = self.clock.now();
        let lock = self.lock_unallocated().await?;
        let existing = self.list().await?;

        let mut claimed: HashMap<HostName, BTreeSet<IpAddr>> = HashMap::new();
        let mut seen = BTreeSet::new();
        let mut transaction = NodeTransaction::new();
        for node in nodes {
            let hostname = node.hostname().clone();
            if !seen.insert(hostname.clone()) || existing.node(&hostname).is_some() {
                return Err(NodeError::AlreadyExists(hostname));
            }
            if node.allocation().is_none() {
                return Err(NodeError::InvalidAllocation {
                    hostname,
                    reason: "containers must be added with an allocation".to_string(),
                });
            }
            let parent = node
                .parent_hostname()
                .and_then(|p| existing.node(p))
                .filter(|p| p.node_type().is_host())
                .ok_or_else(|| NodeError::InvalidAllocation {
                    hostname: hostname.clone(),
                    reason: "parent is not a known host".to_string(),
                })?;

            let free = free_addresses(parent, &existing);
            let taken = claimed.entry(parent.hostname().clone()).or_default();
            for address in &node.ip_config().primary {
                if !free.contains(address) || !taken.insert(*address) {
                    return Err(NodeError::InvalidAllocation {
                        hostname,
                        reason: format!(
                            "address {address} is not free on host {}",
                            parent.hostname()
                        ),
                    });
                }
            }

            let node = node.created(NodeState::Reserved, Agent::Application, now);
            self.db.stage(&mut transaction, None, node, &[&lock])?;
        }

        let added = self.db.commit(transaction).await?;
        info!(count = added.len(), "Added container nodes");
        Ok(added)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Moves a cleaned node from dirty to ready.
    pub async fn set_ready(&self, hostname: &HostName, agent: Agent, reason: &str) -> NodeResult<Node> {
        self.move_to(hostname, NodeState::Ready, agent, reason).await
    }

    /// Moves a host and all its children to dirty.
    ///
    /// Children give their addresses back to the host's pool. If any node
    /// cannot be moved, nothing is written.
    #[instrument(skip_all, fields(host = %hostname))]
    pub async fn dirty_recursively(
        &self,
        hostname: &HostName,
        agent: Agent,
        reason: &str,
    ) -> NodeResult<Vec<Node>> {
        let snapshot = self.list().await?;
        let host = snapshot
            .node(hostname)
            .ok_or_else(|| NodeError::NotFound(hostname.clone()))?;
        let children = snapshot.children_of(hostname);
        let mut targets: Vec<&Node> = children.iter().collect();
        targets.push(host);

        let names = targets
            .iter()
            .map(|n| required_lock(Some(*n), n))
            .collect();
        let locks = self.lock_all(names).await?;
        let held: Vec<&ScopedLock> = locks.iter().collect();

        let now = self.clock.now();
        let mut transaction = NodeTransaction::new();
        for target in targets {
            let current = self.require(target.hostname()).await?;
            if current.value.state() == NodeState::Dirty {
                continue;
            }
            let mut updated =
                current
                    .value
                    .clone()
                    .transition(NodeState::Dirty, agent, now, Some(reason.to_string()))?;
            if updated.is_child() {
                updated = updated.with_ip_config(IpConfig::default());
            }
            self.db.stage(&mut transaction, Some(&current), updated, &held)?;
        }

        let dirtied = self.db.commit(transaction).await?;
        info!(count = dirtied.len(), "Moved host and children to dirty");
        Ok(dirtied)
    }

    /// Grants a ready node to an application.
    pub async fn reserve(&self, hostname: &HostName, allocation: Allocation) -> NodeResult<Node> {
        self.write(hostname, move |node, now| {
            node.with_allocation(allocation)?.transition(
                NodeState::Reserved,
                Agent::Application,
                now,
                None,
            )
        })
        .await
    }

    /// Returns a reserved node to ready, dropping its allocation.
    pub async fn unreserve(&self, hostname: &HostName) -> NodeResult<Node> {
        self.move_to(hostname, NodeState::Ready, Agent::Application, "reservation abandoned")
            .await
    }

    /// Stages activation of `nodes` in `transaction`.
    ///
    /// Nodes are re-read and activated from their persisted version, so a
    /// concurrent change to any of them makes the whole commit fail. The
    /// caller holds the locks and commits with [`NodeRepository::commit`].
    pub async fn activate(
        &self,
        nodes: &[Node],
        transaction: &mut NodeTransaction,
        locks: &[&ScopedLock],
    ) -> NodeResult<Vec<Node>> {
        let now = self.clock.now();
        let mut staged = Vec::with_capacity(nodes.len());
        let mut pending = NodeTransaction::new();
        for node in nodes {
            let current = self.require(node.hostname()).await?;
            let activated =
                current
                    .value
                    .clone()
                    .transition(NodeState::Active, Agent::Application, now, None)?;
            staged.push(activated.clone());
            self.db.stage(&mut pending, Some(&current), activated, locks)?;
        }

        // Only merge once every node validated.
        transaction.append(pending);
        Ok(staged)
    }

    /// Commits a transaction staged by [`NodeRepository::activate`] or others.
    pub async fn commit(&self, transaction: NodeTransaction) -> NodeResult<Vec<Node>> {
        self.db.commit(transaction).await
    }

    /// Moves active nodes to inactive in one commit.
    #[instrument(skip(self, hostnames), fields(count = hostnames.len()))]
    pub async fn deactivate(&self, hostnames: &[HostName], agent: Agent) -> NodeResult<Vec<Node>> {
        let mut names = BTreeSet::new();
        for hostname in hostnames {
            let node = self.require(hostname).await?;
            names.insert(required_lock(Some(&node.value), &node.value));
        }
        let locks = self.lock_all(names).await?;
        let held: Vec<&ScopedLock> = locks.iter().collect();

        let now = self.clock.now();
        let mut transaction = NodeTransaction::new();
        for hostname in hostnames {
            let current = self.require(hostname).await?;
            let inactive = current
                .value
                .clone()
                .transition(NodeState::Inactive, agent, now, None)?;
            self.db.stage(&mut transaction, Some(&current), inactive, &held)?;
        }
        self.db.commit(transaction).await
    }

    /// Releases a node from its application.
    ///
    /// The node goes to dirty for cleaning, or to parked if it is wanted
    /// out of the fleet.
    pub async fn deallocate(&self, hostname: &HostName, agent: Agent, reason: &str) -> NodeResult<Node> {
        let reason = reason.to_string();
        self.write(hostname, move |node, now| {
            let to = if node.status().want_to_deprovision {
                NodeState::Parked
            } else {
                NodeState::Dirty
            };
            Ok(node
                .transition(to, agent, now, Some(reason))?
                .without_allocation())
        })
        .await
    }

    pub async fn fail(&self, hostname: &HostName, agent: Agent, reason: &str) -> NodeResult<Node> {
        self.move_to(hostname, NodeState::Failed, agent, reason).await
    }

    pub async fn park(&self, hostname: &HostName, agent: Agent, reason: &str) -> NodeResult<Node> {
        self.move_to(hostname, NodeState::Parked, agent, reason).await
    }

    pub async fn breakfix(&self, hostname: &HostName, agent: Agent, reason: &str) -> NodeResult<Node> {
        self.move_to(hostname, NodeState::Breakfixed, agent, reason)
            .await
    }

    pub async fn deprovision(&self, hostname: &HostName, agent: Agent, reason: &str) -> NodeResult<Node> {
        self.move_to(hostname, NodeState::Deprovisioned, agent, reason)
            .await
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Asks the node to reboot by raising its wanted reboot generation.
    pub async fn request_reboot(&self, hostname: &HostName) -> NodeResult<Node> {
        self.write(hostname, |node, _| {
            let mut status = node.status().clone();
            status.reboot = status.reboot.with_increased_wanted();
            Ok(node.with_status(status))
        })
        .await
    }

    /// Records the reboot generation the node has reached.
    pub async fn set_current_reboot_generation(&self, hostname: &HostName, current: u64) -> NodeResult<Node> {
        self.write(hostname, |node, _| {
            let mut status = node.status().clone();
            status.reboot.current = current;
            Ok(node.with_status(status))
        })
        .await
    }

    pub async fn set_want_to_retire(&self, hostname: &HostName, want: bool) -> NodeResult<Node> {
        self.write(hostname, |node, _| {
            let mut status = node.status().clone();
            status.want_to_retire = want;
            Ok(node.with_status(status))
        })
        .await
    }

    pub async fn set_want_to_deprovision(&self, hostname: &HostName, want: bool) -> NodeResult<Node> {
        self.write(hostname, |node, _| {
            let mut status = node.status().clone();
            status.want_to_deprovision = want;
            Ok(node.with_status(status))
        })
        .await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn move_to(
        &self,
        hostname: &HostName,
        to: NodeState,
        agent: Agent,
        reason: &str,
    ) -> NodeResult<Node> {
        let node = self
            .write(hostname, |node, now| {
                node.transition(to, agent, now, Some(reason.to_string()))
            })
            .await?;
        info!(%hostname, state = %to, reason, "Moved node");
        Ok(node)
    }

    /// Applies `change` to one node under its lock.
    async fn write<F>(&self, hostname: &HostName, change: F) -> NodeResult<Node>
    where
        F: FnOnce(Node, chrono::DateTime<chrono::Utc>) -> NodeResult<Node>,
    {
        let (lock, current) = self.lock_node(hostname).await?;
        let updated = change(current.value.clone(), self.clock.now())?;
        if updated == current.value {
            return Ok(updated);
        }

        let mut transaction = NodeTransaction::new();
        self.db
            .stage(&mut transaction, Some(&current), updated.clone(), &[&lock])?;
        self.db.commit(transaction).await?;
        Ok(updated)
    }
}

/// Addresses in `host`'s pool not used by its children in `nodes`.
fn free_addresses(host: &Node, nodes: &NodeList) -> BTreeSet<IpAddr> {
    let used: BTreeSet<IpAddr> = nodes
        .children_of(host.hostname())
        .iter()
        .flat_map(|child| child.ip_config().primary.iter().copied())
        .collect();
    host.ip_config().pool.difference(&used).copied().collect()
}
