//! Node lifecycle states and the transition table.
//!
//! Every state change in the repository is validated here. No other code
//! decides whether a transition is legal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    /// Registered, not yet cleaned.
    Provisioned,
    /// Must be cleaned before reuse.
    Dirty,
    /// Clean and available for allocation.
    Ready,
    /// Allocated to an application, not yet activated.
    Reserved,
    /// Serving its application.
    Active,
    /// Released by its application, may be reactivated.
    Inactive,
    /// Taken out of service because of a fault.
    Failed,
    /// Taken out of service by an operator or maintainer.
    Parked,
    /// Undergoing repair.
    Breakfixed,
    /// Removed from the fleet.
    Deprovisioned,
}

impl NodeState {
    pub const ALL: [NodeState; 10] = [
        NodeState::Provisioned,
        NodeState::Dirty,
        NodeState::Ready,
        NodeState::Reserved,
        NodeState::Active,
        NodeState::Inactive,
        NodeState::Failed,
        NodeState::Parked,
        NodeState::Breakfixed,
        NodeState::Deprovisioned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Provisioned => "provisioned",
            NodeState::Dirty => "dirty",
            NodeState::Ready => "ready",
            NodeState::Reserved => "reserved",
            NodeState::Active => "active",
            NodeState::Inactive => "inactive",
            NodeState::Failed => "failed",
            NodeState::Parked => "parked",
            NodeState::Breakfixed => "breakfixed",
            NodeState::Deprovisioned => "deprovisioned",
        }
    }

    /// Returns true if a node in this state may hold an allocation.
    pub fn is_allocated(&self) -> bool {
        matches!(
            self,
            NodeState::Reserved
                | NodeState::Active
                | NodeState::Inactive
                | NodeState::Failed
                | NodeState::Parked
        )
    }

    /// Returns true if the table permits moving from `self` to `to`.
    ///
    /// Some permitted transitions carry further conditions on the node
    /// itself; see [`Node::transition`](crate::Node::transition).
    pub fn can_transition_to(&self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (*self, to),
            (Provisioned, Dirty | Failed | Parked | Deprovisioned)
                | (Dirty, Ready | Failed | Parked | Breakfixed | Deprovisioned)
                | (Ready, Reserved | Active | Dirty | Failed | Parked | Deprovisioned)
                | (Reserved, Ready | Active | Dirty | Failed | Parked)
                | (Active, Inactive | Failed | Parked)
                | (Inactive, Active | Reserved | Dirty | Failed | Parked)
                | (Failed, Dirty | Parked | Breakfixed | Deprovisioned)
                | (Parked, Dirty | Failed | Breakfixed | Deprovisioned)
                | (Breakfixed, Dirty | Failed | Parked | Deprovisioned)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(NodeState::Provisioned, NodeState::Dirty, true)]
    #[case(NodeState::Provisioned, NodeState::Ready, false)]
    #[case(NodeState::Dirty, NodeState::Ready, true)]
    #[case(NodeState::Ready, NodeState::Reserved, true)]
    #[case(NodeState::Ready, NodeState::Active, true)]
    #[case(NodeState::Ready, NodeState::Inactive, false)]
    #[case(NodeState::Reserved, NodeState::Active, true)]
    #[case(NodeState::Reserved, NodeState::Ready, true)]
    #[case(NodeState::Active, NodeState::Inactive, true)]
    #[case(NodeState::Active, NodeState::Dirty, false)]
    #[case(NodeState::Active, NodeState::Ready, false)]
    #[case(NodeState::Inactive, NodeState::Active, true)]
    #[case(NodeState::Inactive, NodeState::Dirty, true)]
    #[case(NodeState::Failed, NodeState::Ready, false)]
    #[case(NodeState::Failed, NodeState::Dirty, true)]
    #[case(NodeState::Parked, NodeState::Breakfixed, true)]
    #[case(NodeState::Breakfixed, NodeState::Dirty, true)]
    #[case(NodeState::Deprovisioned, NodeState::Dirty, false)]
    #[case(NodeState::Deprovisioned, NodeState::Failed, false)]
    fn test_transition_table(#[case] from: NodeState, #[case] to: NodeState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed, "{from} -> {to}");
    }

    #[test]
    fn test_no_self_transitions() {
        for state in NodeState::ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn test_every_live_state_can_fail() {
        for state in NodeState::ALL {
            if matches!(state, NodeState::Failed | NodeState::Deprovisioned) {
                continue;
            }
            assert!(state.can_transition_to(NodeState::Failed), "{state}");
        }
    }

    #[test]
    fn test_serde_names() {
        for state in NodeState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_str()));
        }
    }
}
