//! Filtering over a snapshot of nodes.

use fleet_id::{ApplicationId, HostName};

use crate::{Node, NodeState, NodeType};

/// An immutable list of nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeList {
    nodes: Vec<Node>,
}

impl NodeList {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn into_vec(self) -> Vec<Node> {
        self.nodes
    }

    pub fn node(&self, hostname: &HostName) -> Option<&Node> {
        self.nodes.iter().find(|n| n.hostname() == hostname)
    }

    pub fn filter(&self, predicate: impl Fn(&Node) -> bool) -> NodeList {
        NodeList::new(self.nodes.iter().filter(|n| predicate(n)).cloned().collect())
    }

    pub fn of_type(&self, node_type: NodeType) -> NodeList {
        self.filter(|n| n.node_type() == node_type)
    }

    pub fn in_state(&self, state: NodeState) -> NodeList {
        self.filter(|n| n.state() == state)
    }

    pub fn children_of(&self, parent: &HostName) -> NodeList {
        self.filter(|n| n.parent_hostname() == Some(parent))
    }

    pub fn owned_by(&self, owner: &ApplicationId) -> NodeList {
        self.filter(|n| n.owner() == Some(owner))
    }
}

impl IntoIterator for NodeList {
    type Item = Node;
    type IntoIter = std::vec::IntoIter<Node>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.into_iter()
    }
}
