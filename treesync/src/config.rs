//! Configuration management for treesync.
//!
//! Loads job definitions from a TOML file with environment variable overrides
//! (`TREESYNC__LOG__LEVEL=debug`).

use crate::job::{Retention, SubdirFilter, SyncJob, SyncMode, SyncTarget, VersioningStrategy};
use crate::sync::classify::Tolerance;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "TREESYNC";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append each job's events to `<DST>_fsync.log`
    #[serde(default = "default_job_files")]
    pub job_files: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            job_files: default_job_files(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,

    /// Source tree, never modified
    pub src: PathBuf,

    /// Mirror of `src`
    pub dst: PathBuf,

    /// Backup root; no history is kept without it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bak: Option<PathBuf>,

    /// Versions kept per file or per run folder (integer or "unbounded")
    #[serde(default)]
    pub num_bak: Retention,

    #[serde(default)]
    pub versioning: VersioningStrategy,

    #[serde(default)]
    pub mode: SyncMode,

    /// Propagate SRC deletions to DST
    #[serde(default)]
    pub sync_deleted: bool,

    /// Subdirectory names to sync; wins over `exclude`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,

    /// Subdirectory names to skip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,

    /// Seconds SRC must be newer than DST to count as changed
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,

    #[serde(default)]
    pub dry_run: bool,
}

// Default values
fn default_log_level() -> String {
    "info".to_string()
}

fn default_job_files() -> bool {
    true
}

fn default_tolerance_secs() -> u64 {
    1
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(env_overrides())
            .build()
            .with_context(|| format!("failed to read config file {}", path.display()))?;

        let mut config: Config = settings
            .try_deserialize()
            .with_context(|| format!("invalid config file {}", path.display()))?;

        // Relative job paths are taken relative to the file itself
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base_dir = std::path::absolute(&base_dir).unwrap_or(base_dir);
        for job in &mut config.jobs {
            job.resolve_paths(&base_dir);
        }

        Ok(config)
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Render as TOML (`--print-config`)
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Jobs whose names are in `names`, every job when `names` is empty
    pub fn select_jobs(&self, names: &[String]) -> anyhow::Result<Vec<&JobConfig>> {
        if names.is_empty() {
            return Ok(self.jobs.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.jobs
                    .iter()
                    .find(|job| &job.name == name)
                    .with_context(|| format!("no job named '{name}' in config"))
            })
            .collect()
    }
}

fn env_overrides() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
}

impl JobConfig {
    /// Minimal job description, every option at its default
    pub fn new(name: impl Into<String>, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            src: src.into(),
            dst: dst.into(),
            bak: None,
            num_bak: Retention::default(),
            versioning: VersioningStrategy::default(),
            mode: SyncMode::default(),
            sync_deleted: false,
            include: None,
            exclude: None,
            tolerance_secs: default_tolerance_secs(),
            dry_run: false,
        }
    }

    /// Make `src`, `dst` and `bak` absolute against `base_dir`
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        let absolute = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base_dir.join(&*path);
            }
        };
        absolute(&mut self.src);
        absolute(&mut self.dst);
        if let Some(bak) = self.bak.as_mut() {
            absolute(bak);
        }
    }

    /// Validate and turn into a runnable job; `force_dry_run` overrides the file
    pub fn to_job(&self, force_dry_run: bool) -> crate::Result<SyncJob> {
        let target = SyncTarget::new(&self.src, &self.dst, self.bak.clone());
        SyncJob::builder(&self.name, target)
            .retention(self.num_bak)
            .versioning(self.versioning)
            .mode(self.mode)
            .filter(SubdirFilter::from_lists(
                self.include.clone(),
                self.exclude.clone(),
            ))
            .sync_deleted(self.sync_deleted)
            .dry_run(self.dry_run || force_dry_run)
            .tolerance(Tolerance::from_secs(self.tolerance_secs))
            .build()
    }
}
