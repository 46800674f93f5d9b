//! Reindexing status of an application.
//!
//! The status records, per content cluster and document type, the instant
//! from which reindexing may start, plus entries still waiting for a config
//! generation to converge. Values are immutable; every operation returns a
//! modified copy.
//!
//! The serialized form is also the `GET /reindexing` response body. Fields
//! are declared in key order so the output is sorted.

use std::collections::BTreeMap;

use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The instant reindexing became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(rename = "readyMillis", with = "ts_milliseconds")]
    ready: DateTime<Utc>,
}

impl Status {
    pub fn new(ready: DateTime<Utc>) -> Self {
        Self { ready }
    }

    pub fn ready(&self) -> DateTime<Utc> {
        self.ready
    }

    fn advanced_to(self, at: DateTime<Utc>) -> Self {
        Self::new(self.ready.max(at))
    }
}

/// Reindexing status of one content cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReindexing {
    /// Document type to the config generation that must converge first.
    #[serde(default)]
    pending: BTreeMap<String, i64>,
    #[serde(default)]
    ready: BTreeMap<String, Status>,
    #[serde(rename = "status")]
    common: Status,
}

impl Default for ClusterReindexing {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            ready: BTreeMap::new(),
            common: Status::new(DateTime::<Utc>::UNIX_EPOCH),
        }
    }
}

impl ClusterReindexing {
    pub fn common(&self) -> Status {
        self.common
    }

    pub fn pending(&self) -> &BTreeMap<String, i64> {
        &self.pending
    }

    pub fn ready(&self) -> &BTreeMap<String, Status> {
        &self.ready
    }
}

/// Reindexing status of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationReindexing {
    #[serde(default)]
    clusters: BTreeMap<String, ClusterReindexing>,
    enabled: bool,
    #[serde(rename = "status")]
    common: Status,
}

impl Default for ApplicationReindexing {
    /// Enabled, ready since the epoch, with no clusters.
    fn default() -> Self {
        Self::ready(DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl ApplicationReindexing {
    /// A new, enabled status with everything ready at `at`.
    pub fn ready(at: DateTime<Utc>) -> Self {
        Self {
            clusters: BTreeMap::new(),
            enabled: true,
            common: Status::new(at),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Readiness common to every cluster.
    pub fn common(&self) -> Status {
        self.common
    }

    pub fn clusters(&self) -> &BTreeMap<String, ClusterReindexing> {
        &self.clusters
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterReindexing> {
        self.clusters.get(name)
    }

    /// Returns true if any document type waits for convergence.
    pub fn has_pending(&self) -> bool {
        self.clusters.values().any(|c| !c.pending.is_empty())
    }

    /// Every pending entry as `(cluster, document type, generation)`.
    pub fn pending(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.clusters.iter().flat_map(|(cluster, status)| {
            status
                .pending
                .iter()
                .map(move |(doc_type, generation)| (cluster.as_str(), doc_type.as_str(), *generation))
        })
    }

    /// Marks the whole application ready at `at`. Never moves backward.
    pub fn with_ready(mut self, at: DateTime<Utc>) -> Self {
        self.common = self.common.advanced_to(at);
        self
    }

    /// Marks one cluster ready at `at`. Never moves backward.
    pub fn with_ready_cluster(mut self, cluster: &str, at: DateTime<Utc>) -> Self {
        let status = self.clusters.entry(cluster.to_string()).or_default();
        status.common = status.common.advanced_to(at);
        self
    }

    /// Marks one document type ready at `at`, resolving any pending entry for it.
    pub fn with_ready_type(mut self, cluster: &str, doc_type: &str, at: DateTime<Utc>) -> Self {
        let status = self.clusters.entry(cluster.to_string()).or_default();
        status.pending.remove(doc_type);
        let ready = status
            .ready
            .get(doc_type)
            .map_or(Status::new(at), |current| current.advanced_to(at));
        status.ready.insert(doc_type.to_string(), ready);
        self
    }

    /// Makes a document type wait for `generation` to converge before it is ready again.
    pub fn with_pending(mut self, cluster: &str, doc_type: &str, generation: i64) -> Self {
        let status = self.clusters.entry(cluster.to_string()).or_default();
        status.ready.remove(doc_type);
        status.pending.insert(doc_type.to_string(), generation);
        self
    }

    /// Drops a pending entry without marking the type ready.
    pub fn without_pending(mut self, cluster: &str, doc_type: &str) -> Self {
        if let Some(status) = self.clusters.get_mut(cluster) {
            status.pending.remove(doc_type);
        }
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}
