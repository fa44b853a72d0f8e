use super::{JobContext, JobPayload};
use crate::timer::PhaseTimer;
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fmt::Write as _,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::debug;

/// file listing the nodes granted to a job, one `<network name> <speed factor>` per line
pub const HOSTS_FILE: &str = "hosts";

/// Job that runs an arbitrary executable.
///
/// Before the run it writes its inline input files and the hosts file into the
/// scratch directory; afterwards it reads the declared output files into memory.
/// Arguments may reference the scratch directory as `{dir}`, the hosts file as
/// `{hosts}` and the job id as `{job}`.
#[derive(Debug, Clone)]
pub struct CommandJob {
    exec: PathBuf,
    args: Vec<String>,
    inputs: BTreeMap<String, Vec<u8>>,
    expected_outputs: Vec<String>,
    outputs: BTreeMap<String, Vec<u8>>,
}

impl CommandJob {
    pub fn new(exec: impl Into<PathBuf>) -> Self {
        Self {
            exec: exec.into(),
            args: Vec::new(),
            inputs: BTreeMap::new(),
            expected_outputs: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// file written into the scratch directory before the program runs
    pub fn with_input(mut self, name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.inputs.insert(name.into(), contents.into());
        self
    }

    /// file the program must leave in the scratch directory
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.expected_outputs.push(name.into());
        self
    }

    pub fn exec(&self) -> &Path {
        &self.exec
    }

    /// contents of the output files, filled once the job was finalized
    pub fn outputs(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.outputs
    }

    pub fn output(&self, name: &str) -> Option<&[u8]> {
        self.outputs.get(name).map(Vec::as_slice)
    }

    fn expand(template: &str, context: &JobContext<'_>) -> OsString {
        let directory = context.base_directory.to_string_lossy();
        let hosts = context.base_directory.join(HOSTS_FILE);

        OsString::from(
            template
                .replace("{dir}", &directory)
                .replace("{hosts}", &hosts.to_string_lossy())
                .replace("{job}", &context.id.to_string()),
        )
    }

    fn hosts_file_contents(context: &JobContext<'_>) -> String {
        context
            .nodes
            .iter()
            .fold(String::new(), |mut contents, node| {
                let _ = writeln!(contents, "{} {}", node.network_name, node.speed_factor);
                contents
            })
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

impl JobPayload for CommandJob {
    fn invocation(&self, context: &JobContext<'_>) -> Vec<OsString> {
        std::iter::once(self.exec.clone().into_os_string())
            .chain(self.args.iter().map(|arg| Self::expand(arg, context)))
            .collect()
    }

    fn write_input_files(
        &mut self,
        context: &JobContext<'_>,
        _timer: &mut PhaseTimer,
    ) -> io::Result<()> {
        for (name, contents) in self.inputs.iter() {
            fs::write(context.base_directory.join(name), contents)?;
        }

        fs::write(
            context.base_directory.join(HOSTS_FILE),
            Self::hosts_file_contents(context),
        )
    }

    fn read_output_files(
        &mut self,
        context: &JobContext<'_>,
        timer: &mut PhaseTimer,
    ) -> io::Result<()> {
        timer.start_child("read outputs");

        for name in self.expected_outputs.iter() {
            let contents = fs::read(context.base_directory.join(name))?;
            debug!(job = %context.id, output = %name, "Read {} bytes", contents.len());

            self.outputs.insert(name.clone(), contents);
        }

        timer.stop_child();

        Ok(())
    }

    fn delete_files(&mut self, context: &JobContext<'_>, _timer: &mut PhaseTimer) -> io::Result<()> {
        self.inputs
            .keys()
            .chain(self.expected_outputs.iter())
            .map(String::as_str)
            .chain(std::iter::once(HOSTS_FILE))
            .try_for_each(|name| remove_if_present(&context.base_directory.join(name)))
    }
}
