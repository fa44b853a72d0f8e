use super::SchedulingPolicy;
use crate::{
    job::JobInfo,
    node::{NodeRef, NodeStatus},
};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::BTreeSet,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering as AtomicOrdering},
};

pub const DEFAULT_MAX_NODES_PER_JOB: usize = 5;
pub const DEFAULT_MAX_JOBS_PER_NODE: u32 = 5;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default = "default_max_nodes_per_job")]
    pub max_nodes_per_job: usize,
    #[serde(default = "default_max_jobs_per_node")]
    pub max_jobs_per_node: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_nodes_per_job: DEFAULT_MAX_NODES_PER_JOB,
            max_jobs_per_node: DEFAULT_MAX_JOBS_PER_NODE,
        }
    }
}

fn default_max_nodes_per_job() -> usize {
    DEFAULT_MAX_NODES_PER_JOB
}

fn default_max_jobs_per_node() -> u32 {
    DEFAULT_MAX_JOBS_PER_NODE
}

/// Priority first, least loaded node first.
///
/// Jobs are ordered by descending priority. Nodes are ordered by ascending load,
/// nodes with equal load by how long ago they last received a job, which spreads
/// work round robin over equally loaded nodes. A job gets every node below
/// `max_jobs_per_node` jobs, walking the node order, up to `max_nodes_per_job`
/// nodes.
///
/// Both caps can be changed while jobs are queued; call
/// `Dispatcher::policy_changed` afterwards so queued jobs look again.
#[derive(Debug)]
pub struct SimplePolicy {
    max_nodes_per_job: AtomicUsize,
    max_jobs_per_node: AtomicU32,
}

impl SimplePolicy {
    /// `max_nodes_per_job` is raised to 1 if it is 0, a job always gets at
    /// least one node once any node is below `max_jobs_per_node`.
    pub fn new(max_nodes_per_job: usize, max_jobs_per_node: u32) -> Self {
        Self {
            max_nodes_per_job: AtomicUsize::new(max_nodes_per_job.max(1)),
            max_jobs_per_node: AtomicU32::new(max_jobs_per_node),
        }
    }

    pub fn from_config(config: &PolicyConfig) -> Self {
        Self::new(config.max_nodes_per_job, config.max_jobs_per_node)
    }

    pub fn max_nodes_per_job(&self) -> usize {
        self.max_nodes_per_job.load(AtomicOrdering::SeqCst)
    }

    /// 0 is raised to 1
    pub fn set_max_nodes_per_job(&self, value: usize) {
        self.max_nodes_per_job
            .store(value.max(1), AtomicOrdering::SeqCst);
    }

    pub fn max_jobs_per_node(&self) -> u32 {
        self.max_jobs_per_node.load(AtomicOrdering::SeqCst)
    }

    pub fn set_max_jobs_per_node(&self, value: u32) {
        self.max_jobs_per_node.store(value, AtomicOrdering::SeqCst);
    }
}

impl Default for SimplePolicy {
    fn default() -> Self {
        Self::from_config(&PolicyConfig::default())
    }
}

impl SchedulingPolicy for SimplePolicy {
    fn job_ordering(&self, a: &JobInfo, b: &JobInfo) -> Ordering {
        b.priority.cmp(&a.priority)
    }

    fn node_ordering(&self, a: &NodeStatus, b: &NodeStatus) -> Ordering {
        // `None` (never assigned) sorts before any point in time
        a.load
            .current_load_sum
            .cmp(&b.load.current_load_sum)
            .then_with(|| {
                a.load
                    .time_last_job_assigned
                    .cmp(&b.load.time_last_job_assigned)
            })
            .then_with(|| a.node.cmp(&b.node))
    }

    fn select_nodes(&self, _job: &JobInfo, nodes_in_order: &[NodeStatus]) -> BTreeSet<NodeRef> {
        let max_jobs_per_node = self.max_jobs_per_node();

        nodes_in_order
            .iter()
            .filter(|status| status.load.current_job_count < max_jobs_per_node)
            .take(self.max_nodes_per_job())
            .map(|status| status.node.clone())
            .collect()
    }
}
