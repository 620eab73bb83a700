use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use memoizer_service::config::Config;
use memoizer_service::logging;
use memoizer_service::metrics;

mod stresstest;
mod workloads;

use stresstest::{perform_stresstest, print_report};
use workloads::WorkloadsConfig;

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
}

fn main() {
    if let Err(error) = execute() {
        logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads = WorkloadsConfig::get(&cli.workloads)?;
    let config = Config::get(cli.config.as_deref())?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are at the beginning of the program and no other threads have been spawned yet.
    unsafe { logging::init_logging(&config.logging) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("memoizer-stress")
        .build()
        .context("failed to start tokio runtime")?;

    let duration = cli.duration;
    let reports = runtime.block_on(perform_stresstest(workloads, duration))?;

    for (i, report) in reports.iter().enumerate() {
        print_report(i, report, duration);
    }

    Ok(())
}
