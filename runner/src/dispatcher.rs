use crate::{
    job::{Job, JobContext, JobId, JobInfo, JobPayload, Phase, JOB_TIMER_NAME},
    node::{ComputeNode, NodeLoad, NodeRef, NodeStatus},
    policy::SchedulingPolicy,
    process::{LocalProcessRunner, ProcessError, ProcessRunner},
    timer::PhaseTimer,
};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    fmt, fs, io,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Compute resources busy, job {job} was not scheduled within {waited:?}")]
    SchedulingTimeout { job: JobId, waited: Duration },
    #[error("Unable to create scratch directory {path:?}: {source}")]
    ScratchDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Job {job} failed to {stage}: {source}")]
    Artifact {
        job: JobId,
        stage: ArtifactStage,
        #[source]
        source: io::Error,
    },
    #[error("Job {job} failed to run its compute program: {source}")]
    Process {
        job: JobId,
        #[source]
        source: ProcessError,
    },
}

impl DispatchError {
    /// a job that failed with a recoverable error never ran and may be submitted again
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SchedulingTimeout { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactStage {
    WriteInput,
    ReadOutput,
    Delete,
    RemoveScratchDirectory,
}

fn artifact_error(job: JobId, stage: ArtifactStage) -> impl FnOnce(io::Error) -> DispatchError {
    move |source| DispatchError::Artifact { job, stage, source }
}

impl fmt::Display for ArtifactStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WriteInput => "write input files",
            Self::ReadOutput => "read output files",
            Self::Delete => "delete job files",
            Self::RemoveScratchDirectory => "remove scratch directory",
        })
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// directory the per job scratch directories are created in
    pub scratch_area: PathBuf,
    /// keep job files and scratch directories, only useful for debugging
    pub retain_job_files: bool,
    /// how long `submit` may wait for a grant, zero waits forever
    pub max_scheduling_delay: Duration,
}

impl DispatcherSettings {
    pub fn new(scratch_area: impl Into<PathBuf>) -> Self {
        Self {
            scratch_area: scratch_area.into(),
            retain_job_files: false,
            max_scheduling_delay: Duration::ZERO,
        }
    }
}

/// Copies of the dispatcher's collections, taken atomically
#[derive(Debug, Clone)]
pub struct DispatcherStatus {
    /// in projected order of execution
    pub pending: Vec<JobInfo>,
    /// by job id
    pub active: Vec<JobInfo>,
    /// by node identity
    pub available: Vec<NodeStatus>,
}

/// Bookkeeping behind the dispatcher's monitor. Nothing in here is touched
/// without holding `Dispatcher::state`.
#[derive(Debug)]
struct DispatchState {
    available_nodes: BTreeSet<NodeRef>,
    // every available node plus removed nodes that still host active jobs
    loads: BTreeMap<NodeRef, NodeLoad>,
    // `available_nodes` sorted by the policy's node ordering
    nodes_in_order: Vec<NodeStatus>,
    pending_jobs: Vec<JobInfo>,
    active_jobs: BTreeMap<JobId, JobInfo>,
    next_job_id: u64,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            available_nodes: BTreeSet::new(),
            loads: BTreeMap::new(),
            nodes_in_order: Vec::new(),
            pending_jobs: Vec::new(),
            active_jobs: BTreeMap::new(),
            next_job_id: 1,
        }
    }

    fn mint_job_id(&mut self) -> JobId {
        let id = JobId::new(self.next_job_id);
        self.next_job_id += 1;

        id
    }

    fn load_of(&self, node: &ComputeNode) -> NodeLoad {
        self.loads.get(node).copied().unwrap_or_default()
    }

    /// the only place the node list gets sorted
    fn recalculate_nodes_in_order<P: SchedulingPolicy>(&mut self, policy: &P) {
        let mut nodes_in_order = self
            .available_nodes
            .iter()
            .map(|node| NodeStatus::new(node.clone(), self.load_of(node)))
            .collect::<Vec<_>>();
        nodes_in_order.sort_by(|a, b| policy.node_ordering(a, b));

        self.nodes_in_order = nodes_in_order;
    }

    fn add_node(&mut self, node: NodeRef) {
        let load = self.loads.entry(node.clone()).or_default();
        // a re-added node still running jobs keeps its counters so they keep
        // matching the jobs it hosts
        if load.is_idle() {
            *load = NodeLoad::default();
        }

        // an equal node may carry a new network name or speed factor
        self.available_nodes.replace(node);
    }

    fn remove_node(&mut self, node: &ComputeNode) -> bool {
        let removed = self.available_nodes.remove(node);

        if self.load_of(node).is_idle() {
            self.loads.remove(node);
        }

        removed
    }

    /// insert after every queued job that sorts before or equal to `job`
    fn enqueue<P: SchedulingPolicy>(&mut self, job: JobInfo, policy: &P) -> usize {
        let position = self
            .pending_jobs
            .partition_point(|queued| policy.job_ordering(queued, &job) != Ordering::Greater);
        self.pending_jobs.insert(position, job);

        position
    }

    /// ask the policy for nodes if `id` is at the head of the queue
    fn select_for_head<P: SchedulingPolicy>(
        &self,
        id: JobId,
        policy: &P,
    ) -> Option<BTreeSet<NodeRef>> {
        let head = self.pending_jobs.first().filter(|head| head.id == id)?;
        let nodes = policy.select_nodes(head, &self.nodes_in_order);

        if nodes.is_empty() {
            None
        } else {
            Some(nodes)
        }
    }

    fn withdraw(&mut self, id: JobId) {
        self.pending_jobs.retain(|job| job.id != id);
    }

    fn activate<P: SchedulingPolicy>(
        &mut self,
        id: JobId,
        nodes: &BTreeSet<NodeRef>,
        assigned_at: Instant,
        policy: &P,
    ) {
        let Some(position) = self.pending_jobs.iter().position(|job| job.id == id) else {
            return;
        };
        let mut job = self.pending_jobs.remove(position);
        job.nodes_assigned_to = nodes.clone();

        for node in nodes {
            let load = self.loads.entry(node.clone()).or_default();
            load.current_load_sum += job.cost;
            load.current_job_count += 1;
            load.time_last_job_assigned = Some(assigned_at);
        }

        self.active_jobs.insert(id, job);
        self.recalculate_nodes_in_order(policy);
    }

    fn release<P: SchedulingPolicy>(
        &mut self,
        id: JobId,
        nodes: &BTreeSet<NodeRef>,
        cost: u64,
        policy: &P,
    ) {
        self.active_jobs.remove(&id);

        for node in nodes {
            if let Some(load) = self.loads.get_mut(node) {
                load.current_load_sum = load.current_load_sum.saturating_sub(cost);
                load.current_job_count = load.current_job_count.saturating_sub(1);

                if load.is_idle() && !self.available_nodes.contains(node) {
                    self.loads.remove(node);
                }
            }
        }

        self.recalculate_nodes_in_order(policy);
    }
}

/// Nodes granted to a running job. Dropping it gives the nodes back, so the
/// load of a job is reverted on every way out of `submit`, panics included.
struct Reservation<'a, P: SchedulingPolicy> {
    dispatcher: &'a Dispatcher<P>,
    job: JobId,
    nodes: BTreeSet<NodeRef>,
    cost: u64,
}

impl<P: SchedulingPolicy> Drop for Reservation<'_, P> {
    fn drop(&mut self) {
        let mut state = self.dispatcher.state.lock();
        state.release(self.job, &self.nodes, self.cost, &self.dispatcher.policy);
        self.dispatcher.wakeup.notify_all();

        debug!(job = %self.job, "Released {} node(s)", self.nodes.len());
    }
}

/// Schedules jobs onto compute nodes and runs them.
///
/// There is no dispatcher thread: every caller of `submit` waits for its own
/// grant and then drives its own job to completion. All bookkeeping lives in one
/// mutex guarded `DispatchState`; the condition variable is notified whenever
/// something a waiting job could care about changed.
pub struct Dispatcher<P: SchedulingPolicy> {
    state: Mutex<DispatchState>,
    wakeup: Condvar,
    policy: P,
    settings: DispatcherSettings,
    runner: Box<dyn ProcessRunner>,
}

impl<P: SchedulingPolicy> Dispatcher<P> {
    /// dispatcher that runs compute programs on the local machine
    pub fn new(
        nodes: impl IntoIterator<Item = ComputeNode>,
        settings: DispatcherSettings,
        policy: P,
    ) -> Self {
        Self::with_runner(nodes, settings, policy, LocalProcessRunner::new())
    }

    pub fn with_runner(
        nodes: impl IntoIterator<Item = ComputeNode>,
        settings: DispatcherSettings,
        policy: P,
        runner: impl ProcessRunner + 'static,
    ) -> Self {
        let mut state = DispatchState::new();
        for node in nodes {
            state.add_node(Arc::new(node.normalized()));
        }
        state.recalculate_nodes_in_order(&policy);

        Self {
            state: Mutex::new(state),
            wakeup: Condvar::new(),
            policy,
            settings,
            runner: Box::new(runner),
        }
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Make a node available for scheduling. Its counters start from zero
    /// unless it still hosts jobs from before it was removed.
    pub fn add_node(&self, node: ComputeNode) {
        let node = Arc::new(node.normalized());
        debug!(node = %node, "Adding node");

        let mut state = self.state.lock();
        state.add_node(node);
        state.recalculate_nodes_in_order(&self.policy);
        self.wakeup.notify_all();
    }

    /// Stop scheduling onto a node. Jobs already running there are not
    /// affected; poll `report_status` to see them finish.
    pub fn remove_node(&self, node: &ComputeNode) -> bool {
        debug!(node = %node, "Removing node");

        let mut state = self.state.lock();
        let removed = state.remove_node(node);
        state.recalculate_nodes_in_order(&self.policy);
        self.wakeup.notify_all();

        removed
    }

    /// give `job` its id ahead of `submit`, which then keeps it
    pub fn assign_job_id<J>(&self, job: &mut Job<J>) -> JobId {
        if let Some(id) = job.id {
            return id;
        }

        let id = self.state.lock().mint_job_id();
        job.id = Some(id);

        id
    }

    /// Let queued jobs look at the policy again, e.g. after its limits changed.
    pub fn policy_changed(&self) {
        let mut state = self.state.lock();
        state.recalculate_nodes_in_order(&self.policy);
        self.wakeup.notify_all();
    }

    pub fn report_status(&self) -> DispatcherStatus {
        let state = self.state.lock();

        DispatcherStatus {
            pending: state.pending_jobs.clone(),
            active: state.active_jobs.values().cloned().collect(),
            available: state
                .available_nodes
                .iter()
                .map(|node| NodeStatus::new(node.clone(), state.load_of(node)))
                .collect(),
        }
    }

    /// Current counters of a node, `None` for nodes the dispatcher does not
    /// know (anymore).
    pub fn node_load(&self, node: &ComputeNode) -> Option<NodeLoad> {
        self.state.lock().loads.get(node).copied()
    }

    /// Submit `job` and run it.
    ///
    /// Blocks until the policy grants the job a set of nodes (or the scheduling
    /// delay runs out), then prepares, executes and finalizes the job on the
    /// calling thread. A nonzero exit code of the compute program is not an
    /// error; it is left in `job.error_code()`.
    #[tracing::instrument(level = "debug", skip_all, fields(priority = job.priority, cost = job.cost))]
    pub fn submit<J: JobPayload>(&self, job: &mut Job<J>) -> Result<(), DispatchError> {
        // a job may be submitted again, nothing of an earlier run carries over
        job.nodes_assigned_to.clear();
        job.base_directory = None;
        job.error_code = 0;
        job.error_message = None;
        job.timer = PhaseTimer::new(JOB_TIMER_NAME);
        job.timer.start_child(Phase::Queued.as_str());

        let reservation = match self.admit(job) {
            Ok(reservation) => reservation,
            Err(error) => {
                job.timer.stop();
                return Err(error);
            }
        };

        let result = self.execute(job, reservation.job);

        drop(reservation);
        job.timer.stop();

        result
    }

    /// queue the job and wait for its grant
    fn admit<J>(&self, job: &mut Job<J>) -> Result<Reservation<'_, P>, DispatchError> {
        let mut state = self.state.lock();

        let id = match job.id {
            Some(id) => id,
            None => {
                let id = state.mint_job_id();
                job.id = Some(id);
                id
            }
        };
        let position = state.enqueue(job.info(id), &self.policy);
        debug!(job = %id, position, "Job queued");

        let max_delay = self.settings.max_scheduling_delay;
        let nodes = loop {
            if let Some(nodes) = state.select_for_head(id, &self.policy) {
                break nodes;
            }

            if max_delay.is_zero() {
                self.wakeup.wait(&mut state);
            } else {
                let waited = job.timer.current_child_elapsed();

                if waited >= max_delay {
                    state.withdraw(id);
                    // someone else may be at the head now
                    self.wakeup.notify_all();
                    debug!(job = %id, waited = ?waited, "Scheduling delay exceeded");

                    return Err(DispatchError::SchedulingTimeout { job: id, waited });
                }

                self.wakeup.wait_for(&mut state, max_delay - waited);
            }
            trace!(job = %id, "Woke up, checking for a grant");
        };

        let assigned_at = job
            .timer
            .start_child(Phase::Preparing.as_str())
            .started_at();
        state.activate(id, &nodes, assigned_at, &self.policy);
        self.wakeup.notify_all();
        drop(state);

        debug!(job = %id, nodes = ?nodes.iter().map(|node| node.name.as_str()).collect::<Vec<_>>(), "Job granted");
        job.nodes_assigned_to = nodes.clone();

        Ok(Reservation {
            dispatcher: self,
            job: id,
            nodes,
            cost: job.cost,
        })
    }

    /// everything between grant and release, runs without the monitor
    fn execute<J: JobPayload>(&self, job: &mut Job<J>, id: JobId) -> Result<(), DispatchError> {
        let base_directory = self.settings.scratch_area.join(id.directory_name());
        fs::create_dir(&base_directory).map_err(|source| DispatchError::ScratchDirectory {
            path: base_directory.clone(),
            source,
        })?;
        job.base_directory = Some(base_directory.clone());

        let context = JobContext {
            id,
            base_directory: &base_directory,
            nodes: &job.nodes_assigned_to,
        };
        job.payload
            .write_input_files(&context, job.timer.active_mut())
            .map_err(artifact_error(id, ArtifactStage::WriteInput))?;

        job.timer.start_child(Phase::Executing.as_str());
        let invocation = job.payload.invocation(&context);
        debug!(job = %id, invocation = ?invocation, "Running compute program");

        let output = self
            .runner
            .run(&invocation)
            .map_err(|source| DispatchError::Process { job: id, source })?;
        job.error_code = output.status;
        job.error_message = Some(output.stderr).filter(|stderr| !stderr.is_empty());

        job.timer.start_child(Phase::Finalizing.as_str());
        job.payload
            .read_output_files(&context, job.timer.active_mut())
            .map_err(artifact_error(id, ArtifactStage::ReadOutput))?;

        if !self.settings.retain_job_files {
            job.payload
                .delete_files(&context, job.timer.active_mut())
                .map_err(artifact_error(id, ArtifactStage::Delete))?;
            fs::remove_dir_all(&base_directory)
                .map_err(artifact_error(id, ArtifactStage::RemoveScratchDirectory))?;
        }

        Ok(())
    }
}
