//! Node repository.
//!
//! The authoritative record of every host in the fleet: its lifecycle
//! state, resources, network identity and tenant allocation.
//!
//! The repository is responsible for:
//! - Validating node state changes against one central transition table
//! - Persisting nodes in the coordination store, only under the lock
//!   scoped to the node's owner (or the unallocated pool)
//! - Committing multi-node changes such as activation atomically
//! - Accounting host capacity and reporting fleet metrics

pub mod capacity;
pub mod db;
mod error;
pub mod list;
pub mod metrics;
pub mod node;
pub mod repository;
pub mod resources;
pub mod state;

pub use capacity::CapacityReport;
pub use db::{NodeStore, NodeTransaction};
pub use error::{NodeError, NodeResult};
pub use list::NodeList;
pub use metrics::{InMemoryMetric, LogMetric, MetricSink, MetricsReporter};
pub use node::{
    Agent, Allocation, ClusterMembership, ClusterSpec, ClusterType, Generation, HistoryEvent,
    IpConfig, Node, NodeType, Status,
};
pub use repository::{NodeRepository, NodeRepositoryConfig};
pub use resources::{Flavor, NodeResources};
pub use state::NodeState;
