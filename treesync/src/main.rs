//! treesync - Main entry point
//!
//! Runs the jobs of a config file, or a single ad-hoc job from the command line.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use treesync::config::{Config, JobConfig};
use treesync::daemon::shutdown::ShutdownCoordinator;
use treesync::events::{FanoutSink, JsonLinesSink, LogFileSink, StderrWarnings, TracingSink};
use treesync::job::{Retention, SyncMode, VersioningStrategy};
use treesync::{utils, RunContext, SyncError, SyncExecutor, SyncReport};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run only the named job(s) of the config file
    #[arg(short, long, value_name = "NAME", requires = "config")]
    job: Vec<String>,

    /// Source directory of an ad-hoc job
    #[arg(long, value_name = "DIR", conflicts_with = "config", requires = "dst")]
    src: Option<PathBuf>,

    /// Destination directory of an ad-hoc job
    #[arg(long, value_name = "DIR", requires = "src")]
    dst: Option<PathBuf>,

    /// Backup directory of an ad-hoc job
    #[arg(long, value_name = "DIR", requires = "src")]
    bak: Option<PathBuf>,

    /// Versions to keep (a positive number or "unbounded")
    #[arg(long, value_name = "N", default_value = "5")]
    num_bak: Retention,

    #[arg(long, value_enum, default_value_t = VersioningStrategy::PerFile)]
    versioning: VersioningStrategy,

    #[arg(long, value_enum, default_value_t = SyncMode::WholeTree)]
    mode: SyncMode,

    /// Only sync these subdirectories ("." for the root files); wins over --exclude
    #[arg(long, value_name = "NAME")]
    include: Vec<String>,

    /// Skip these subdirectories ("." for the root files)
    #[arg(long, value_name = "NAME")]
    exclude: Vec<String>,

    /// Propagate deletions from SRC to DST
    #[arg(long)]
    sync_deleted: bool,

    /// Seconds SRC must be newer than DST to count as changed
    #[arg(long, value_name = "SECS", default_value_t = 1)]
    tolerance_secs: u64,

    /// Name of the ad-hoc job
    #[arg(long, default_value = "adhoc")]
    name: String,

    /// Report what would happen without touching any file
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Print events as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    /// Job described by the ad-hoc flags, paths resolved against the working directory
    fn adhoc_job(&self) -> Result<Option<JobConfig>> {
        let (Some(src), Some(dst)) = (&self.src, &self.dst) else {
            return Ok(None);
        };
        let mut job = JobConfig::new(&self.name, src, dst);
        job.bak = self.bak.clone();
        job.num_bak = self.num_bak;
        job.versioning = self.versioning;
        job.mode = self.mode;
        job.sync_deleted = self.sync_deleted;
        job.include = (!self.include.is_empty()).then(|| self.include.clone());
        job.exclude = (!self.exclude.is_empty()).then(|| self.exclude.clone());
        job.tolerance_secs = self.tolerance_secs;
        job.resolve_paths(&std::env::current_dir().context("no working directory")?);
        Ok(Some(job))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };
    if let Some(job) = args.adhoc_job()? {
        config.jobs.push(job);
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!("Starting treesync v{}", env!("CARGO_PKG_VERSION"));

    let jobs: Vec<JobConfig> = config.select_jobs(&args.job)?.into_iter().cloned().collect();
    if jobs.is_empty() {
        bail!("nothing to do: pass --config FILE or --src DIR --dst DIR");
    }

    // Create shutdown coordinator
    let shutdown_coordinator = ShutdownCoordinator::new();
    let cancel_token = shutdown_coordinator.token();
    let signal_handle = tokio::spawn(async move {
        shutdown_coordinator.wait_for_signal().await;
    });

    let mut failed = Vec::new();
    for job_config in jobs {
        if cancel_token.is_cancelled() {
            tracing::warn!("Shutdown requested, skipping job {}", job_config.name);
            failed.push(job_config.name);
            continue;
        }

        let name = job_config.name.clone();
        let outcome = run_job(
            job_config,
            args.dry_run,
            args.json,
            config.log.job_files,
            cancel_token.clone(),
        )
        .await;

        match outcome {
            Ok(report) => tracing::info!("Job {} finished: {}", name, report),
            Err(e) => {
                tracing::error!("Job {} failed: {:#}", name, e);
                failed.push(name);
            }
        }
    }

    signal_handle.abort();

    if !failed.is_empty() {
        bail!("{} job(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

/// Validate one job and run a single pass of it on the blocking pool
async fn run_job(
    job_config: JobConfig,
    force_dry_run: bool,
    json: bool,
    job_files: bool,
    cancel_token: CancellationToken,
) -> Result<SyncReport> {
    let job = job_config
        .to_job(force_dry_run)
        .with_context(|| format!("invalid job '{}'", job_config.name))?;

    let mut sink = FanoutSink::new()
        .with(TracingSink::new(job.name()))
        .with(StderrWarnings);
    if job_files {
        let log_path = LogFileSink::path_for_destination(&job.target().dst);
        match LogFileSink::open(&log_path) {
            Ok(file_sink) => sink = sink.with(file_sink),
            Err(e) => tracing::warn!("Cannot open job log {}: {}", log_path.display(), e),
        }
    }
    if json {
        sink = sink.with(JsonLinesSink::new(std::io::stdout()));
    }

    let report = tokio::task::spawn_blocking(move || {
        let run = RunContext::start();
        SyncExecutor::with_cancel(&job, &sink, cancel_token).run(&run)
    })
    .await
    .context("sync task panicked")?;

    match report {
        Ok(report) => Ok(report),
        Err(SyncError::Cancelled) => bail!("cancelled by shutdown signal"),
        Err(e) if e.is_configuration() => bail!("job setup no longer valid: {e}"),
        Err(e) => Err(e.into()),
    }
}
