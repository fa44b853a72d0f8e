use crate::{
    dispatcher::{Dispatcher, DispatcherSettings},
    job::{command::CommandJob, command::HOSTS_FILE, Job},
    node::ComputeNode,
    policy::{PolicyConfig, SimplePolicy},
    process::LocalProcessRunner,
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Component, Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, info, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

// a name that stays inside the scratch directory when joined onto it
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();

    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Config is not valid YAML: {0}")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to determine the local host name")]
    HostnameNotFound(#[from] nix::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    // nodes jobs may be dispatched to, the local host is used if this is empty
    #[serde(default)]
    pub nodes: Vec<ComputeNode>,
    // directory that receives one scratch directory per job
    #[serde(alias = "job_scratch_area")]
    pub scratch_area: PathBuf,
    #[serde(default)]
    pub retain_job_files: bool,
    // milliseconds a job may wait for nodes, 0 waits forever
    #[serde(default)]
    pub max_scheduling_delay: u64,
    // milliseconds a compute program may run before it is killed
    pub execution_timeout: Option<u64>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    // jobs submitted by the command line runner
    #[serde(default)]
    pub jobs: BTreeMap<String, JobConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // number of submitting threads, defaults to the number of cpus
    pub threads: Option<usize>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub cost: u64,
    // file name -> contents, written into the scratch directory
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    // file names read back from the scratch directory
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl JobConfig {
    pub fn to_job(&self) -> Job<CommandJob> {
        let payload = self.inputs.iter().fold(
            CommandJob::new(&self.exec).with_args(self.params.iter().cloned()),
            |payload, (name, contents)| payload.with_input(name.clone(), contents.as_bytes()),
        );
        let payload = self
            .outputs
            .iter()
            .fold(payload, |payload, name| payload.with_output(name.clone()));

        Job::new(self.priority, self.cost, payload)
    }
}

impl DispatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigErrors> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            scratch_area: self.scratch_area.clone(),
            retain_job_files: self.retain_job_files,
            max_scheduling_delay: Duration::from_millis(self.max_scheduling_delay),
        }
    }

    pub fn process_runner(&self) -> LocalProcessRunner {
        match self.execution_timeout {
            Some(timeout) => LocalProcessRunner::with_timeout(Duration::from_millis(timeout)),
            None => LocalProcessRunner::new(),
        }
    }

    /// dispatcher with the simple policy, configured from `self`
    pub fn dispatcher(&self) -> Dispatcher<SimplePolicy> {
        Dispatcher::with_runner(
            self.nodes.iter().cloned(),
            self.settings(),
            SimplePolicy::from_config(&self.policy),
            self.process_runner(),
        )
    }

    /// the local host as the one and only node
    pub fn local_node() -> Result<ComputeNode, ConfigErrors> {
        let hostname = nix::unistd::gethostname()?;

        Ok(ComputeNode::new(hostname.to_string_lossy()))
    }

    /// Check the config for problems, logging every one of them instead of
    /// stopping at the first. Returns `true` if an error was found.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if !self.scratch_area.is_dir() {
            error!(
                "scratch_area {} is not a directory",
                self.scratch_area.to_string_lossy()
            );
            contains_error = true;
        }

        if self.nodes.is_empty() {
            match Self::local_node() {
                Ok(node) => {
                    warn!("No nodes were defined, falling back to the local host {node}");
                    self.nodes.push(node);
                }
                Err(e) => {
                    error!("No nodes were defined and the local host is unknown: {e}");
                    contains_error = true;
                }
            }
        }

        for (name, count) in self.nodes.iter().map(|node| &node.name).counts() {
            if name.is_empty() {
                error!("nodes contains a node without a name");
                contains_error = true;
            } else if count > 1 {
                error!("Node {name} is defined {count} times");
                contains_error = true;
            }
        }

        if self.policy.max_nodes_per_job == 0 {
            error!("policy.max_nodes_per_job cannot be 0, no job could ever be scheduled");
            contains_error = true;
        }

        if self.policy.max_jobs_per_node == 0 {
            error!("policy.max_jobs_per_node cannot be 0, no job could ever be scheduled");
            contains_error = true;
        }

        if self.runner.threads == Some(0) {
            error!("runner.threads cannot be 0");
            contains_error = true;
        }

        if self.jobs.is_empty() {
            info!("No jobs were defined, there is nothing to dispatch");
        }

        for (name, job) in self.jobs.iter() {
            match check_executable(&job.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Job {name} target {} is not executable",
                        job.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if jobs.{name}.exec ({}) is an executable: {e}",
                        job.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            for file in job.inputs.keys().chain(job.outputs.iter()) {
                if !is_plain_file_name(file) {
                    error!("Job {name} file {file} must be a plain file name");
                    contains_error = true;
                }
            }

            if job.inputs.contains_key(HOSTS_FILE) || job.outputs.iter().any(|file| file == HOSTS_FILE) {
                error!("Job {name} cannot use {HOSTS_FILE}, it is written by the dispatcher");
                contains_error = true;
            }
        }

        contains_error
    }
}
