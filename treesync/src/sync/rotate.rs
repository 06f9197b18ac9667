//! Backup version rotation.
//!
//! Superseded or deleted DST files are moved into the backup tree instead of
//! being lost, and the number of kept versions is bounded by the retention
//! policy. Two on-disk layouts exist:
//!
//! - per-file: `BAK/dir/report_fsync2024-03-01_101500_.txt`, versions of one
//!   file sit next to each other and are pruned per file;
//! - per-run: `BAK/2024-03-01_101500_alice/dir/report.txt`, one folder per pass,
//!   pruned as whole folders.
//!
//! Pruning never fails a pass. A version that cannot be removed is reported
//! and stays on disk.

use crate::events::{ChangeKind, EventSink, SyncEvent};
use crate::executor::context::{parse_timestamp, RunContext, TIMESTAMP_LEN};
use crate::executor::report::SyncReport;
use crate::fs::ops::FsOps;
use crate::fs::walker::RelPath;
use crate::job::{Retention, VersioningStrategy};
use crate::utils::Result;
use chrono::NaiveDateTime;
use std::cell::Cell;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Marker between a file's stem and the version timestamp
pub const VERSION_MARKER: &str = "_fsync";

/// Split a file name into stem and extension (extension keeps its dot).
/// Leading dots belong to the stem, so `.bashrc` has no extension.
pub fn split_extension(file_name: &str) -> (&str, &str) {
    let leading = file_name.len() - file_name.trim_start_matches('.').len();
    match file_name[leading..].rfind('.') {
        Some(idx) => file_name.split_at(leading + idx),
        None => (file_name, ""),
    }
}

/// Name of a per-file backup version: `<stem>_fsync<timestamp>_<.ext>`
pub fn versioned_file_name(file_name: &str, timestamp: &str) -> String {
    let (stem, ext) = split_extension(file_name);
    format!("{stem}{VERSION_MARKER}{timestamp}_{ext}")
}

/// Timestamp of `candidate` if it is a per-file version of `file_name`
pub fn version_timestamp(candidate: &str, file_name: &str) -> Option<NaiveDateTime> {
    let (stem, ext) = split_extension(file_name);
    let stamp = candidate
        .strip_prefix(stem)?
        .strip_prefix(VERSION_MARKER)?
        .strip_suffix(ext)?
        .strip_suffix('_')?;
    parse_timestamp(stamp)
}

/// Timestamp of a per-run folder named `<timestamp>_<user>`
pub fn run_folder_timestamp(name: &str) -> Option<NaiveDateTime> {
    let stamp = name.get(..TIMESTAMP_LEN)?;
    let rest = name.get(TIMESTAMP_LEN..)?;
    if rest.len() < 2 || !rest.starts_with('_') {
        return None;
    }
    parse_timestamp(stamp)
}

/// Existing per-file versions of `file_name` in `folder`, oldest first
pub fn file_versions(folder: &Path, file_name: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(folder) else {
        return Vec::new();
    };
    let mut versions: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            version_timestamp(&name, file_name)?;
            Some((name, entry.path()))
        })
        .collect();
    versions.sort();
    versions.into_iter().map(|(_, path)| path).collect()
}

/// Per-run folders directly inside `root`, oldest first
pub fn run_folders(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut folders: Vec<(NaiveDateTime, String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let stamp = run_folder_timestamp(&name)?;
            Some((stamp, name, entry.path()))
        })
        .collect();
    folders.sort();
    folders.into_iter().map(|(_, _, path)| path).collect()
}

/// Make sure the configured backup root can be used.
///
/// Returns `None`, after a `BackupDisabled` warning, when the root is missing
/// and cannot be created. The pass then runs without history.
pub fn establish_backup_root(
    path: Option<&Path>,
    ops: &FsOps,
    sink: &dyn EventSink,
    report: &mut SyncReport,
) -> Option<PathBuf> {
    let path = path?;
    if path.is_dir() {
        return Some(path.to_path_buf());
    }

    let reason = if path.exists() {
        Some("exists but is not a directory".to_string())
    } else if !path.parent().is_some_and(Path::is_dir) {
        Some("parent directory does not exist".to_string())
    } else {
        ops.create_dir_all(path).err().map(|e| e.to_string())
    };

    match reason {
        None => Some(path.to_path_buf()),
        Some(reason) => {
            disable(path, reason, sink, report);
            None
        }
    }
}

/// Backup root of one subdirectory unit, `<root>/<name>`
pub fn establish_unit_root(
    root: &Path,
    name: &str,
    ops: &FsOps,
    sink: &dyn EventSink,
    report: &mut SyncReport,
) -> Option<PathBuf> {
    let path = root.join(name);
    if path.exists() && !path.is_dir() {
        disable(&path, "exists but is not a directory".to_string(), sink, report);
        return None;
    }
    match ops.create_dir_all(&path) {
        Ok(()) => Some(path),
        Err(e) => {
            disable(&path, e.to_string(), sink, report);
            None
        }
    }
}

fn disable(path: &Path, reason: String, sink: &dyn EventSink, report: &mut SyncReport) {
    let event = SyncEvent::BackupDisabled {
        path: path.to_path_buf(),
        reason,
    };
    report.warnings.push(event.to_string());
    sink.emit(&event);
}

/// Versions removed by one pruning step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneTally {
    pub pruned: usize,
    pub failed: usize,
}

impl PruneTally {
    pub fn record(&self, report: &mut SyncReport) {
        report.versions_pruned += self.pruned;
        report.prune_failures += self.failed;
    }
}

/// Outcome of moving one DST file into the backup tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub backup: PathBuf,
    pub prune: PruneTally,
}

/// Moves superseded files of one sync unit into its backup root
pub struct BackupRotator<'a> {
    root: PathBuf,
    strategy: VersioningStrategy,
    retention: Retention,
    run: &'a RunContext,
    ops: FsOps,
    sink: &'a dyn EventSink,
    /// Set once this pass put something into its per-run folder
    run_folder_used: Cell<bool>,
    /// Folder names under `root` that belong to other units, never pruned
    protected: Vec<String>,
}

impl<'a> BackupRotator<'a> {
    pub fn new(
        root: impl Into<PathBuf>,
        strategy: VersioningStrategy,
        retention: Retention,
        run: &'a RunContext,
        ops: FsOps,
        sink: &'a dyn EventSink,
    ) -> Self {
        Self {
            root: root.into(),
            strategy,
            retention,
            run,
            ops,
            sink,
            run_folder_used: Cell::new(false),
            protected: Vec::new(),
        }
    }

    /// Leave these folders alone when pruning run folders, even when their
    /// names parse as run tags
    pub fn protecting(mut self, names: Vec<String>) -> Self {
        self.protected = names;
        self
    }

    /// Where the current DST copy of `rel` goes
    pub fn backup_path(&self, rel: &RelPath) -> PathBuf {
        match self.strategy {
            VersioningStrategy::PerFile => {
                let folder = rel
                    .parent()
                    .map(|parent| parent.to_path(&self.root))
                    .unwrap_or_else(|| self.root.clone());
                folder.join(versioned_file_name(rel.file_name(), &self.run.timestamp()))
            }
            VersioningStrategy::PerRun => rel.to_path(&self.root.join(self.run.tag())),
        }
    }

    /// Move `dst_root/rel` into the backup tree.
    ///
    /// With per-file versioning, older versions of the same file are pruned
    /// first so that the retention count holds once the new one is in place.
    pub fn relocate(&self, dst_root: &Path, rel: &RelPath, change: ChangeKind) -> Result<Relocation> {
        let source = rel.to_path(dst_root);
        let backup = self.backup_path(rel);
        let folder = backup.parent().unwrap_or(&self.root).to_path_buf();

        let prune = match self.strategy {
            VersioningStrategy::PerFile => self.prune_file_versions(&folder, rel.file_name()),
            VersioningStrategy::PerRun => {
                self.run_folder_used.set(true);
                PruneTally::default()
            }
        };

        self.sink.emit(&SyncEvent::BackedUp {
            path: rel.clone(),
            change,
            backup: backup.clone(),
        });
        self.ops.create_dir_all(&folder)?;
        self.ops.move_file(&source, &backup)?;

        Ok(Relocation { backup, prune })
    }

    /// Keep `limit - 1` existing versions so the incoming one makes `limit`
    fn prune_file_versions(&self, folder: &Path, file_name: &str) -> PruneTally {
        let Some(limit) = self.retention.limit() else {
            return PruneTally::default();
        };
        let versions = file_versions(folder, file_name);
        self.prune_oldest(versions, limit - 1, |ops, path| ops.remove_file(path))
    }

    /// Remove whole run folders beyond the retention count.
    ///
    /// The folder of the current pass counts as the newest version whenever
    /// something was moved into it, even in a dry run where it was never
    /// created, so both modes prune the same folders.
    pub fn prune_runs(&self) -> PruneTally {
        if self.strategy != VersioningStrategy::PerRun {
            return PruneTally::default();
        }
        let Some(limit) = self.retention.limit() else {
            return PruneTally::default();
        };

        let current = self.root.join(self.run.tag());
        let folders: Vec<PathBuf> = run_folders(&self.root)
            .into_iter()
            .filter(|path| *path != current)
            .filter(|path| !self.is_protected(path))
            .collect();
        let keep_existing = if self.run_folder_used.get() || current.is_dir() {
            limit - 1
        } else {
            limit
        };
        self.prune_oldest(folders, keep_existing, |ops, path| ops.remove_dir_all(path))
    }

    fn is_protected(&self, folder: &Path) -> bool {
        folder
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.protected.iter().any(|p| p == name))
    }

    fn prune_oldest<F>(&self, versions: Vec<PathBuf>, keep: usize, remove: F) -> PruneTally
    where
        F: Fn(&FsOps, &Path) -> std::io::Result<()>,
    {
        let mut tally = PruneTally::default();
        let excess = versions.len().saturating_sub(keep);
        for version in versions.into_iter().take(excess) {
            match remove(&self.ops, &version) {
                Ok(()) => {
                    self.sink.emit(&SyncEvent::Pruned {
                        version: version.clone(),
                    });
                    tally.pruned += 1;
                }
                Err(e) => {
                    debug!("Pruning {} failed: {:?}", version.display(), e);
                    self.sink.emit(&SyncEvent::PruneFailed {
                        version: version.clone(),
                        error: e.to_string(),
                    });
                    tally.failed += 1;
                }
            }
        }
        tally
    }
}
