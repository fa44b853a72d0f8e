use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Instant,
};

/// One compute resource that jobs may be dispatched to.
///
/// Nodes are identified and ordered by `name` alone; two descriptors with the
/// same name are the same node as far as the dispatcher is concerned, whatever
/// their network name or speed factor.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ComputeNode {
    pub name: String,
    // host name the compute program should use to reach this node, defaults to `name`
    #[serde(default)]
    pub network_name: String,
    // relative speed handed to the compute program, larger is faster
    #[serde(default = "default_speed_factor")]
    pub speed_factor: u64,
}

fn default_speed_factor() -> u64 {
    1
}

impl ComputeNode {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();

        Self {
            network_name: name.clone(),
            name,
            speed_factor: default_speed_factor(),
        }
    }

    pub fn with_network_name(mut self, network_name: impl Into<String>) -> Self {
        self.network_name = network_name.into();
        self
    }

    pub fn with_speed_factor(mut self, speed_factor: u64) -> Self {
        self.speed_factor = speed_factor;
        self
    }

    /// fill in an empty network name from `name`
    pub(crate) fn normalized(mut self) -> Self {
        if self.network_name.is_empty() {
            self.network_name = self.name.clone();
        }
        self
    }
}

impl PartialEq for ComputeNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ComputeNode {}

impl PartialOrd for ComputeNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComputeNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(&other.name)
    }
}

impl Hash for ComputeNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ComputeNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Shared handle to a node, cheap to hand out in grants and snapshots
pub type NodeRef = Arc<ComputeNode>;

/// Load counters of a node. Only ever changed by the dispatcher while it holds
/// its monitor; everything outside of it sees copies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeLoad {
    /// sum of `cost` over the active jobs assigned to the node
    pub current_load_sum: u64,
    /// number of active jobs assigned to the node
    pub current_job_count: u32,
    /// `None` until the node receives its first job
    pub time_last_job_assigned: Option<Instant>,
}

impl NodeLoad {
    pub fn is_idle(&self) -> bool {
        self.current_job_count == 0
    }
}

/// A node together with its load as of the moment the value was taken
#[derive(Clone, Debug)]
pub struct NodeStatus {
    pub node: NodeRef,
    pub load: NodeLoad,
}

impl NodeStatus {
    pub fn new(node: NodeRef, load: NodeLoad) -> Self {
        Self { node, load }
    }
}
