use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use requery_service::config::Config;
use requery_service::logging::ensure_log_error;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Log to the console as configured, instead of only exercising the logging machinery.
    #[arg(long, short)]
    verbose: bool,

    /// Enable tracing, with all output discarded.
    #[arg(long)]
    tracing: bool,

    /// Enable sentry, reporting to a local sink.
    #[arg(long)]
    sentry: bool,

    /// Enable metrics, reporting to a local sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(err) = run() {
        ensure_log_error(&err);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    let service_config = Config::get(cli.config.as_deref())?;

    let logging_config = logging::Config {
        verbose: cli.verbose,
        tracing: cli.tracing,
        sentry: cli.sentry,
        metrics: cli.metrics,
    };
    // SAFETY: No other threads have been spawned yet.
    let mut logging_guard = unsafe { logging::init(logging_config, &service_config) };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        if let Some(http_sink) = logging_guard.http_sink.take() {
            tokio::spawn(http_sink);
        }
        if let Some(udp_sink) = logging_guard.udp_sink.take() {
            tokio::spawn(udp_sink);
        }

        let result = perform_stresstest(service_config, workloads, cli.duration).await;
        drop(logging_guard);
        result
    })
}
