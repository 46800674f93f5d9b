//! The node record and its parts.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleet_id::{ApplicationId, HostName};
use serde::{Deserialize, Serialize};

use crate::{Flavor, NodeError, NodeResources, NodeResult, NodeState};

/// History events kept per node.
pub const MAX_HISTORY: usize = 32;

/// Role of a node in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Runs tenant workloads, either on bare metal or as a container.
    Tenant,
    /// Physical host for tenant containers.
    Host,
    /// Routing proxy.
    Proxy,
    ConfigServer,
    Controller,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Tenant => "tenant",
            NodeType::Host => "host",
            NodeType::Proxy => "proxy",
            NodeType::ConfigServer => "configserver",
            NodeType::Controller => "controller",
        }
    }

    /// Returns true if nodes of this type can run children.
    pub fn is_host(&self) -> bool {
        matches!(self, NodeType::Host)
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Agent {
    System,
    Operator,
    Application,
    NodeFailer,
}

/// IP addresses of a node.
///
/// `primary` are the node's own addresses. For hosts, `pool` holds the
/// addresses that may be handed to children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    pub primary: BTreeSet<IpAddr>,
    pub pool: BTreeSet<IpAddr>,
}

impl IpConfig {
    pub fn new(
        primary: impl IntoIterator<Item = IpAddr>,
        pool: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        Self {
            primary: primary.into_iter().collect(),
            pool: pool.into_iter().collect(),
        }
    }
}

/// A wanted and a current generation of something the node must act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub wanted: u64,
    pub current: u64,
}

impl Generation {
    /// Returns true if the node has not caught up with the wanted generation.
    pub fn pending(&self) -> bool {
        self.current < self.wanted
    }

    pub fn with_increased_wanted(self) -> Self {
        Self {
            wanted: self.wanted + 1,
            ..self
        }
    }
}

/// Operational flags and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub reboot: Generation,
    pub want_to_retire: bool,
    pub want_to_deprovision: bool,
    pub fail_count: u32,
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub state: NodeState,
    pub agent: Agent,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// Cluster membership
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    Admin,
    Container,
    Content,
    Combined,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Admin => "admin",
            ClusterType::Container => "container",
            ClusterType::Content => "content",
            ClusterType::Combined => "combined",
        }
    }
}

impl FromStr for ClusterType {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(ClusterType::Admin),
            "container" => Ok(ClusterType::Container),
            "content" => Ok(ClusterType::Content),
            "combined" => Ok(ClusterType::Combined),
            other => Err(NodeError::InvalidMembership(format!(
                "unknown cluster type '{other}'"
            ))),
        }
    }
}

/// A cluster within an application.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterSpec {
    pub cluster_type: ClusterType,
    pub id: String,
    pub group: Option<u32>,
}

/// A node's place in a cluster, written `type/id[/group]/index[/retired]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterMembership {
    pub cluster: ClusterSpec,
    pub index: u32,
    pub retired: bool,
}

impl ClusterMembership {
    pub fn retire(self) -> Self {
        Self {
            retired: true,
            ..self
        }
    }
}

impl FromStr for ClusterMembership {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NodeError::InvalidMembership(s.to_string());
        let mut parts: Vec<&str> = s.split('/').collect();

        let retired = parts.last() == Some(&"retired");
        if retired {
            parts.pop();
        }

        let (cluster_type, id, group, index) = match parts.as_slice() {
            [cluster_type, id, index] => (cluster_type, id, None, index),
            [cluster_type, id, group, index] => (cluster_type, id, Some(group), index),
            _ => return Err(invalid()),
        };
        if id.is_empty() {
            return Err(invalid());
        }

        let group = group
            .map(|g| g.parse::<u32>().map_err(|_| invalid()))
            .transpose()?;
        Ok(Self {
            cluster: ClusterSpec {
                cluster_type: cluster_type.parse()?,
                id: id.to_string(),
                group,
            },
            index: index.parse().map_err(|_| invalid())?,
            retired,
        })
    }
}

impl fmt::Display for ClusterMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster.cluster_type.as_str(), self.cluster.id)?;
        if let Some(group) = self.cluster.group {
            write!(f, "/{group}")?;
        }
        write!(f, "/{}", self.index)?;
        if self.retired {
            f.write_str("/retired")?;
        }
        Ok(())
    }
}

impl Serialize for ClusterMembership {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClusterMembership {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The grant of a node to an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub owner: ApplicationId,
    pub membership: ClusterMembership,
    pub requested_resources: NodeResources,
    #[serde(default)]
    pub restart: Generation,
    #[serde(default)]
    pub removable: bool,
}

impl Allocation {
    pub fn new(
        owner: ApplicationId,
        membership: ClusterMembership,
        requested_resources: NodeResources,
    ) -> Self {
        Self {
            owner,
            membership,
            requested_resources,
            restart: Generation::default(),
            removable: false,
        }
    }
}

// =============================================================================
// Node
// =============================================================================

/// A host in the fleet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    id: String,
    hostname: HostName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_hostname: Option<HostName>,
    ip_config: IpConfig,
    flavor: Flavor,
    node_type: NodeType,
    state: NodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allocation: Option<Allocation>,
    #[serde(default)]
    status: Status,
    /// Bumped on every state change.
    #[serde(default)]
    state_generation: u64,
    #[serde(default)]
    history: Vec<HistoryEvent>,
}

impl Node {
    /// Creates a node in state provisioned.
    pub fn create(
        id: impl Into<String>,
        ip_config: IpConfig,
        hostname: HostName,
        flavor: Flavor,
        node_type: NodeType,
    ) -> Self {
        Self {
            id: id.into(),
            hostname,
            parent_hostname: None,
            ip_config,
            flavor,
            node_type,
            state: NodeState::Provisioned,
            allocation: None,
            status: Status::default(),
            state_generation: 0,
            history: Vec::new(),
        }
    }

    /// Creates a tenant container on `parent`, sized to `resources`.
    pub fn create_container(
        addresses: impl IntoIterator<Item = IpAddr>,
        hostname: HostName,
        parent: HostName,
        resources: NodeResources,
    ) -> Self {
        let mut node = Self::create(
            hostname.value().to_string(),
            IpConfig::new(addresses, []),
            hostname,
            Flavor::custom(resources),
            NodeType::Tenant,
        );
        node.parent_hostname = Some(parent);
        node
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &HostName {
        &self.hostname
    }

    pub fn parent_hostname(&self) -> Option<&HostName> {
        self.parent_hostname.as_ref()
    }

    pub fn ip_config(&self) -> &IpConfig {
        &self.ip_config
    }

    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    pub fn resources(&self) -> &NodeResources {
        &self.flavor.resources
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn allocation(&self) -> Option<&Allocation> {
        self.allocation.as_ref()
    }

    pub fn owner(&self) -> Option<&ApplicationId> {
        self.allocation.as_ref().map(|a| &a.owner)
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn state_generation(&self) -> u64 {
        self.state_generation
    }

    pub fn history(&self) -> &[HistoryEvent] {
        &self.history
    }

    /// Returns true if this node runs on another node.
    pub fn is_child(&self) -> bool {
        self.parent_hostname.is_some()
    }

    /// Grants this node to an application.
    ///
    /// The requested resources must fit the node's flavor.
    pub fn with_allocation(mut self, allocation: Allocation) -> NodeResult<Self> {
        if !allocation.requested_resources.fits_within(&self.flavor.resources) {
            return Err(NodeError::ResourcesExceedFlavor {
                hostname: self.hostname.clone(),
                flavor: self.flavor.name.clone(),
                requested: allocation.requested_resources.to_string(),
                available: self.flavor.resources.to_string(),
            });
        }
        if self.node_type.is_host() {
            return Err(NodeError::InvalidAllocation {
                hostname: self.hostname.clone(),
                reason: "hosts are not allocated to applications".to_string(),
            });
        }
        self.allocation = Some(allocation);
        Ok(self)
    }

    /// Records the creation of this node directly in `state`.
    pub(crate) fn created(mut self, state: NodeState, agent: Agent, at: DateTime<Utc>) -> Self {
        self.state = state;
        self.history.push(HistoryEvent {
            state,
            agent,
            at,
            reason: None,
        });
        self
    }

    pub(crate) fn without_allocation(mut self) -> Self {
        self.allocation = None;
        self
    }

    pub fn with_ip_config(mut self, ip_config: IpConfig) -> Self {
        self.ip_config = ip_config;
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    /// Moves this node to `to`, recording who did it and when.
    ///
    /// Besides the transition table, tenant nodes must carry an allocation
    /// to be reserved or activated, and only hosts may go from ready to
    /// active directly. Entering dirty, ready or deprovisioned drops the
    /// allocation.
    pub fn transition(
        mut self,
        to: NodeState,
        agent: Agent,
        at: DateTime<Utc>,
        reason: Option<String>,
    ) -> NodeResult<Self> {
        let from = self.state;
        let invalid = |reason: &str| NodeError::InvalidTransition {
            hostname: self.hostname.clone(),
            from,
            to,
            reason: reason.to_string(),
        };

        if !from.can_transition_to(to) {
            return Err(invalid("not a permitted transition"));
        }
        if from == NodeState::Ready && to == NodeState::Active && !self.node_type.is_host() {
            return Err(invalid("only hosts may be activated without a reservation"));
        }
        if matches!(to, NodeState::Reserved | NodeState::Active)
            && !self.node_type.is_host()
            && self.allocation.is_none()
        {
            return Err(invalid("node has no allocation"));
        }

        if matches!(
            to,
            NodeState::Dirty | NodeState::Ready | NodeState::Deprovisioned
        ) {
            self.allocation = None;
        }
        if to == NodeState::Failed {
            self.status.fail_count += 1;
        }

        self.state = to;
        self.state_generation += 1;
        self.history.push(HistoryEvent {
            state: to,
            agent,
            at,
            reason,
        });
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        Ok(self)
    }
}
