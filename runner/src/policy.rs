pub mod simple;

pub use simple::{PolicyConfig, SimplePolicy};


use crate::{
    job::JobInfo,
    node::{NodeRef, NodeStatus},
};
use std::{cmp::Ordering, collections::BTreeSet};

/// Scheduling intelligence plugged into a `Dispatcher`.
///
/// All three functions are called while the dispatcher holds its monitor, so
/// they must be fast and must never block.
pub trait SchedulingPolicy: Send + Sync {
    /// Order of the pending queue. `Ordering::Less` means `a` is scheduled
    /// before `b`. Must be stable for the lifetime of both jobs.
    fn job_ordering(&self, a: &JobInfo, b: &JobInfo) -> Ordering;

    /// Order of the node list handed to `select_nodes`, from "most eligible to
    /// receive the next job" to "least eligible".
    fn node_ordering(&self, a: &NodeStatus, b: &NodeStatus) -> Ordering;

    /// Decide on which nodes `job`, currently at the head of the pending queue,
    /// may run. An empty set means "not yet" and keeps the job queued.
    fn select_nodes(&self, job: &JobInfo, nodes_in_order: &[NodeStatus]) -> BTreeSet<NodeRef>;
}
