pub mod config;
pub mod dispatcher;
pub mod job;
pub mod node;
pub mod policy;
pub mod process;
pub mod timer;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherSettings, DispatcherStatus};
pub use job::{Job, JobContext, JobId, JobInfo, JobPayload, Phase};
pub use node::{ComputeNode, NodeLoad, NodeStatus};
pub use policy::{SchedulingPolicy, SimplePolicy};
