use std::{
    ffi::OsString,
    io::{self, Read},
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Invocation is empty, there is no program to run")]
    EmptyInvocation,
    #[error("Failed to spawn {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to wait for a child process: {0}")]
    Wait(#[source] io::Error),
    #[error("Failed to capture output of a child process: {0}")]
    Capture(#[source] io::Error),
    #[error("Child process exceeded its execution timeout of {0:?} and was killed")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Default)]
/// container for information extracted from running a compute program
pub struct RunOutput {
    pub runtime: Duration,
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

/// Runs the external compute program of a job.
///
/// Implementations block until the program terminates. A nonzero exit status
/// is a regular result, not an error; errors are reserved for failures to
/// start, observe or finish the program.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, invocation: &[OsString]) -> Result<RunOutput, ProcessError>;
}

/// Runner that spawns the program on the local machine
#[derive(Debug, Clone, Default)]
pub struct LocalProcessRunner {
    timeout: Option<Duration>,
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// kill the program and fail once it ran longer than `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl ProcessRunner for LocalProcessRunner {
    #[tracing::instrument(level = "debug", skip(self))]
    fn run(&self, invocation: &[OsString]) -> Result<RunOutput, ProcessError> {
        let (program, args) = invocation
            .split_first()
            .ok_or(ProcessError::EmptyInvocation)?;
        let start = Instant::now();

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: PathBuf::from(program),
                source,
            })?;

        // both pipes are drained concurrently, otherwise a child filling one of them
        // blocks forever while we wait on it
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        debug!("Process waiting on {}", child.id());
        let status = match self.timeout {
            Some(timeout) => match child.wait_timeout(timeout).map_err(ProcessError::Wait)? {
                Some(status) => status,
                None => {
                    debug!("Process ran into timeout, killing {}", child.id());

                    if let Err(error) = child.kill() {
                        warn!(error = ?error, "Failed to kill timed out process");
                    }
                    if let Err(error) = child.wait() {
                        warn!(error = ?error, "Failed to reap timed out process");
                    }
                    // the readers end with the pipes, their content is of no use anymore
                    let _ = collect(stdout);
                    let _ = collect(stderr);

                    return Err(ProcessError::Timeout(timeout));
                }
            },
            None => child.wait().map_err(ProcessError::Wait)?,
        };

        let output = RunOutput {
            runtime: start.elapsed(),
            stdout: collect(stdout)?,
            stderr: collect(stderr)?,
            status: exit_code(status),
        };

        debug!(
            "Finished in {} ns | status: {}",
            output.runtime.as_nanos(),
            output.status
        );
        trace!("Output: {}", output.stdout);

        Ok(output)
    }
}

/// exit code of a process, signals are mapped the way shells report them
pub fn exit_code(status: ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            pipe.read_to_end(&mut buffer)?;

            Ok(buffer)
        })
    })
}

fn collect(handle: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Result<String, ProcessError> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };

    let bytes = handle
        .join()
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "output reader panicked")))
        .map_err(ProcessError::Capture)?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
