use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use scan_runner::config::{LogConfig, RunnerConfig};
use scan_runner::lock::InstanceLock;
use scan_runner::shutdown::install_shutdown_handler;
use scan_runner::store::FsJobStore;
use scan_runner::worker::RunnerLoop;

/// Local job execution daemon for scan jobs.
#[derive(Debug, Parser)]
#[command(name = "scan-runner", version, about)]
struct Args {
    /// Root holding the pending, staging and done directories.
    working_dir: PathBuf,

    /// Log to stdout instead of the rotating log file.
    #[arg(short = 'l', long, env = "SCAN_RUNNER_STDOUT_LOG")]
    stdout_log: bool,

    /// Directory for rotated log files.
    #[arg(long, env = "SCAN_RUNNER_LOG_DIR", default_value = "/var/log/scan-runner")]
    log_dir: PathBuf,

    /// Delay between scans of the pending directory.
    #[arg(long, env = "SCAN_RUNNER_POLL_INTERVAL", default_value = "15s", value_parser = humantime::parse_duration)]
    poll_interval: Duration,

    /// Jobs run at once.
    #[arg(long, env = "SCAN_RUNNER_SLOTS", default_value_t = 4)]
    slots: usize,

    /// Default per-job timeout.
    #[arg(long, env = "SCAN_RUNNER_JOB_TIMEOUT", default_value = "24h", value_parser = humantime::parse_duration)]
    job_timeout: Duration,

    /// Time between SIGTERM and SIGKILL.
    #[arg(long, env = "SCAN_RUNNER_GRACE_PERIOD", default_value = "10s", value_parser = humantime::parse_duration)]
    grace_period: Duration,

    /// How long to wait for output pipes to close after the tool exits.
    #[arg(long, env = "SCAN_RUNNER_DRAIN_TIMEOUT", default_value = "5s", value_parser = humantime::parse_duration)]
    drain_timeout: Duration,

    /// Override the pending directory (default `<WORKING_DIR>/running`).
    #[arg(long, env = "SCAN_RUNNER_PENDING_DIR")]
    pending_dir: Option<PathBuf>,

    /// Override the staging directory (default `<WORKING_DIR>/.staging`).
    #[arg(long, env = "SCAN_RUNNER_STAGING_DIR")]
    staging_dir: Option<PathBuf>,

    /// Override the done directory (default `<WORKING_DIR>/done`).
    #[arg(long, env = "SCAN_RUNNER_DONE_DIR")]
    done_dir: Option<PathBuf>,
}

impl Args {
    fn runner_config(&self) -> RunnerConfig {
        let mut config = RunnerConfig::for_root(&self.working_dir)
            .with_poll_interval(self.poll_interval)
            .with_slots(self.slots)
            .with_job_timeout(self.job_timeout)
            .with_grace_period(self.grace_period)
            .with_drain_timeout(self.drain_timeout);
        if let Some(dir) = &self.pending_dir {
            config.pending_dir = dir.clone();
        }
        if let Some(dir) = &self.staging_dir {
            config.staging_dir = dir.clone();
        }
        if let Some(dir) = &self.done_dir {
            config.done_dir = dir.clone();
        }
        config
    }

    fn log_config(&self) -> LogConfig {
        LogConfig {
            stdout: self.stdout_log,
            directory: self.log_dir.clone(),
            ..LogConfig::default()
        }
    }
}

/// Initialize tracing. The returned guard flushes the file writer on drop.
fn init_logging(config: &LogConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.stdout {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
        return Ok(None);
    }

    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("creating log directory {}", config.directory.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.directory)
        .context("creating rolling log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    std::fs::create_dir_all(&args.working_dir)
        .with_context(|| format!("creating working directory {}", args.working_dir.display()))?;
    let _lock = InstanceLock::acquire(&args.working_dir)?;
    let _log_guard = init_logging(&args.log_config())?;

    let config = args.runner_config();
    config.validate()?;
    config.ensure_dirs()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        working_dir = %args.working_dir.display(),
        "Scan runner starting"
    );

    let shutdown = install_shutdown_handler().context("installing signal handlers")?;
    let store = Arc::new(FsJobStore::new(
        config.pending_dir.clone(),
        config.staging_dir.clone(),
    ));

    let summary = RunnerLoop::new(config, store).run(shutdown).await?;
    tracing::info!(?summary, "Scan runner exited");
    Ok(())
}
