pub mod command;

use crate::{
    node::NodeRef,
    timer::{PhaseTimer, TimerSnapshot},
};
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fmt, io,
    path::{Path, PathBuf},
};

/// Identity of a job, unique within the lifetime of its dispatcher
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// name of the job's scratch directory, e.g. `job00000042`
    pub fn directory_name(self) -> String {
        format!("job{:08}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phases a submitted job passes through, in this order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Queued,
    Preparing,
    Executing,
    Finalizing,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Queued,
        Phase::Preparing,
        Phase::Executing,
        Phase::Finalizing,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Preparing => "preparing",
            Phase::Executing => "executing",
            Phase::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of a job the dispatcher schedules on: identity, priority, cost and,
/// once granted, its nodes. Pending and active collections hold these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub priority: u32,
    pub cost: u64,
    /// empty while the job is pending
    pub nodes_assigned_to: BTreeSet<NodeRef>,
}

/// What the dispatcher hands to a payload's callbacks
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    pub id: JobId,
    /// scratch directory reserved for this job, exists while callbacks run
    pub base_directory: &'a Path,
    pub nodes: &'a BTreeSet<NodeRef>,
}

/// The domain specific half of a job.
///
/// The dispatcher calls, in order: `write_input_files`, `invocation` (the
/// program is run), `read_output_files` and, unless job files are retained,
/// `delete_files`. Any `Err` aborts the job.
pub trait JobPayload {
    /// argument vector of the compute program, program first
    fn invocation(&self, context: &JobContext<'_>) -> Vec<OsString>;

    fn write_input_files(
        &mut self,
        context: &JobContext<'_>,
        timer: &mut PhaseTimer,
    ) -> io::Result<()>;

    fn read_output_files(
        &mut self,
        context: &JobContext<'_>,
        timer: &mut PhaseTimer,
    ) -> io::Result<()>;

    fn delete_files(&mut self, context: &JobContext<'_>, timer: &mut PhaseTimer) -> io::Result<()>;
}

/// A unit of distributed computation, submitted through `Dispatcher::submit`.
///
/// Everything but priority, cost and payload is filled in by the dispatcher and
/// may be inspected once `submit` returned.
#[derive(Debug)]
pub struct Job<P> {
    pub(crate) id: Option<JobId>,
    pub(crate) priority: u32,
    pub(crate) cost: u64,
    pub(crate) nodes_assigned_to: BTreeSet<NodeRef>,
    pub(crate) base_directory: Option<PathBuf>,
    pub(crate) error_code: i32,
    pub(crate) error_message: Option<String>,
    pub(crate) timer: PhaseTimer,
    pub(crate) payload: P,
}

impl<P: JobPayload> Job<P> {
    /// `priority`: higher values are scheduled sooner by the default policy.
    /// `cost`: estimate of the single node run time, in caller defined units.
    pub fn new(priority: u32, cost: u64, payload: P) -> Self {
        Self {
            id: None,
            priority,
            cost,
            nodes_assigned_to: BTreeSet::new(),
            base_directory: None,
            error_code: 0,
            error_message: None,
            timer: PhaseTimer::new(JOB_TIMER_NAME),
            payload,
        }
    }
}

/// name of the root timer of every job, the phases are its children
pub const JOB_TIMER_NAME: &str = "submit";

impl<P> Job<P> {
    pub fn id(&self) -> Option<JobId> {
        self.id
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn nodes_assigned_to(&self) -> &BTreeSet<NodeRef> {
        &self.nodes_assigned_to
    }

    pub fn base_directory(&self) -> Option<&Path> {
        self.base_directory.as_deref()
    }

    /// exit code of the compute program, by convention nonzero means failure
    pub fn error_code(&self) -> i32 {
        self.error_code
    }

    /// standard error of the compute program, `None` if it wrote nothing
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// timings of the phases the job went through so far
    pub fn timings(&self) -> TimerSnapshot {
        self.timer.snapshot()
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut P {
        &mut self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub(crate) fn info(&self, id: JobId) -> JobInfo {
        JobInfo {
            id,
            priority: self.priority,
            cost: self.cost,
            nodes_assigned_to: self.nodes_assigned_to.clone(),
        }
    }
}
