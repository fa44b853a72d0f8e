use clap::Parser;
use dispatch_runner::{config::DispatchConfig, DispatchError};
use itertools::Itertools;
use rayon::{prelude::*, ThreadPoolBuilder};
use std::{
    path::PathBuf,
    process::ExitCode,
    sync::atomic::{AtomicU64, Ordering},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Dispatch the jobs of a config file onto its compute nodes
struct Cli {
    /// Path to the config file
    #[arg(short, long, default_value = "dispatch.yaml")]
    config: PathBuf,

    /// Keep job scratch directories once the jobs are done
    #[arg(long)]
    retain: bool,

    /// Log debug output (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = DispatchConfig::from_file(&cli.config).unwrap_or_log();
    config.retain_job_files |= cli.retain;

    if config.preflight_checks() {
        error!("Config {} contains errors, aborting", cli.config.to_string_lossy());

        return ExitCode::FAILURE;
    }

    let dispatcher = config.dispatcher();
    let thread_number = config.runner.threads.unwrap_or_else(num_cpus::get);

    debug!("Starting thread pool with {thread_number} threads");

    ThreadPoolBuilder::new()
        .num_threads(thread_number)
        .build_global()
        .unwrap_or_log();

    // general counters to report progress
    let total = config.jobs.len();
    let processed = AtomicU64::new(0);
    let failed = AtomicU64::new(0);

    config.jobs.par_iter().for_each(|(name, job_config)| {
        let mut job = job_config.to_job();

        match dispatcher.submit(&mut job) {
            Ok(()) => {
                let timings = job.timings();

                info!(
                    job = %name,
                    id = ?job.id(),
                    nodes = %job.nodes_assigned_to().iter().join(","),
                    status = job.error_code(),
                    "Finished in {:?} ({})",
                    timings.elapsed,
                    timings
                        .children
                        .iter()
                        .map(|phase| format!("{}: {:?}", phase.name, phase.elapsed))
                        .join(", ")
                );

                if job.error_code() != 0 {
                    warn!(
                        job = %name,
                        stderr = job.error_message().unwrap_or_default(),
                        "Compute program failed with status {}",
                        job.error_code()
                    );
                    failed.fetch_add(1, Ordering::SeqCst);
                }

                for (output, contents) in job.payload().outputs() {
                    debug!(job = %name, output = %output, "Collected {} bytes", contents.len());
                }
            }
            Err(error @ DispatchError::SchedulingTimeout { .. }) => {
                warn!(job = %name, "Job was not scheduled: {error}");
                failed.fetch_add(1, Ordering::SeqCst);
            }
            Err(error) => {
                error!(job = %name, error = ?error, "Job failed: {error}");
                failed.fetch_add(1, Ordering::SeqCst);
            }
        }

        info!(
            "Done with {}/{}",
            processed.fetch_add(1, Ordering::SeqCst) + 1,
            total
        );
    });

    let status = dispatcher.report_status();
    for node in status.available.iter() {
        info!(
            node = %node.node,
            load = node.load.current_load_sum,
            jobs = node.load.current_job_count,
            "Node status"
        );
    }

    let failed = failed.load(Ordering::SeqCst);
    if failed > 0 {
        error!("{failed} of {total} job(s) did not succeed");

        ExitCode::FAILURE
    } else {
        info!("Done with processing");

        ExitCode::SUCCESS
    }
}
