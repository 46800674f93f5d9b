//! Node resources and flavors.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing resource amounts.
pub const EPSILON: f64 = 1e-9;

/// An amount of compute resources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResources {
    pub vcpu: f64,
    pub memory_gb: f64,
    pub disk_gb: f64,
    pub bandwidth_gbps: f64,
}

impl NodeResources {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0, 0.0);

    pub const fn new(vcpu: f64, memory_gb: f64, disk_gb: f64, bandwidth_gbps: f64) -> Self {
        Self {
            vcpu,
            memory_gb,
            disk_gb,
            bandwidth_gbps,
        }
    }

    /// Returns true if every dimension of `self` fits within `other`.
    pub fn fits_within(&self, other: &NodeResources) -> bool {
        self.vcpu <= other.vcpu + EPSILON
            && self.memory_gb <= other.memory_gb + EPSILON
            && self.disk_gb <= other.disk_gb + EPSILON
            && self.bandwidth_gbps <= other.bandwidth_gbps + EPSILON
    }

    /// Returns true if every dimension is within [`EPSILON`] of `other`.
    pub fn approx_eq(&self, other: &NodeResources) -> bool {
        (self.vcpu - other.vcpu).abs() <= EPSILON
            && (self.memory_gb - other.memory_gb).abs() <= EPSILON
            && (self.disk_gb - other.disk_gb).abs() <= EPSILON
            && (self.bandwidth_gbps - other.bandwidth_gbps).abs() <= EPSILON
    }
}

impl Add for NodeResources {
    type Output = NodeResources;

    fn add(self, other: NodeResources) -> NodeResources {
        NodeResources::new(
            self.vcpu + other.vcpu,
            self.memory_gb + other.memory_gb,
            self.disk_gb + other.disk_gb,
            self.bandwidth_gbps + other.bandwidth_gbps,
        )
    }
}

impl Sub for NodeResources {
    type Output = NodeResources;

    fn sub(self, other: NodeResources) -> NodeResources {
        NodeResources::new(
            self.vcpu - other.vcpu,
            self.memory_gb - other.memory_gb,
            self.disk_gb - other.disk_gb,
            self.bandwidth_gbps - other.bandwidth_gbps,
        )
    }
}

impl std::iter::Sum for NodeResources {
    fn sum<I: Iterator<Item = NodeResources>>(iter: I) -> NodeResources {
        iter.fold(NodeResources::ZERO, Add::add)
    }
}

impl fmt::Display for NodeResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[vcpu: {}, memory: {} Gb, disk: {} Gb, bandwidth: {} Gbps]",
            self.vcpu, self.memory_gb, self.disk_gb, self.bandwidth_gbps
        )
    }
}

/// A named hardware (or container) shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flavor {
    pub name: String,
    pub resources: NodeResources,
}

impl Flavor {
    pub fn new(name: impl Into<String>, resources: NodeResources) -> Self {
        Self {
            name: name.into(),
            resources,
        }
    }

    /// A flavor sized exactly to `resources`, as used for containers.
    pub fn custom(resources: NodeResources) -> Self {
        Self::new(
            format!(
                "d-{}-{}-{}",
                resources.vcpu, resources.memory_gb, resources.disk_gb
            ),
            resources,
        )
    }
}
