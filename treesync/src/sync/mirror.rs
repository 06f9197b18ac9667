//! Applies change decisions to disk for one sync unit.
//!
//! A unit is a SRC/DST pair, walked recursively or (for the loose files of a
//! root) one level deep. When DST does not exist yet the unit is seeded with
//! a plain copy; otherwise both sides are listed, classified, superseded DST
//! files go through the backup rotator and SRC files are copied forward.

use crate::events::{ChangeKind, EventSink, SyncEvent};
use crate::executor::report::SyncReport;
use crate::fs::metadata::snapshot;
use crate::fs::ops::{CopyOutcome, FsOps};
use crate::fs::walker::{list_files_shallow, list_tree, RelPath, TreeListing};
use crate::sync::classify::Classifier;
use crate::sync::rotate::BackupRotator;
use crate::sync::SyncPhase;
use crate::utils::{Result, SyncError};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One SRC/DST pair processed as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorUnit {
    pub name: String,
    pub src: PathBuf,
    pub dst: PathBuf,
    /// Descend into subfolders; false mirrors only the files directly in `src`
    pub recursive: bool,
}

impl MirrorUnit {
    fn list(&self, root: &Path) -> Result<TreeListing> {
        if self.recursive {
            list_tree(root)
        } else {
            Ok(TreeListing {
                folders: Vec::new(),
                files: list_files_shallow(root)?,
            })
        }
    }
}

pub struct TreeMirror<'a> {
    classifier: Classifier,
    sync_deleted: bool,
    ops: FsOps,
    sink: &'a dyn EventSink,
    cancel_token: &'a CancellationToken,
}

impl<'a> TreeMirror<'a> {
    pub fn new(
        classifier: Classifier,
        sync_deleted: bool,
        ops: FsOps,
        sink: &'a dyn EventSink,
        cancel_token: &'a CancellationToken,
    ) -> Self {
        Self {
            classifier,
            sync_deleted,
            ops,
            sink,
            cancel_token,
        }
    }

    /// Bring `unit.dst` in line with `unit.src`.
    ///
    /// Without a rotator, changed files are overwritten in place and deleted
    /// files stay in DST.
    pub fn run(&self, unit: &MirrorUnit, rotator: Option<&BackupRotator<'_>>) -> Result<SyncReport> {
        let mut report = SyncReport {
            units: 1,
            ..Default::default()
        };

        if !unit.dst.is_dir() {
            self.phase(unit, SyncPhase::Seeding);
            self.seed(unit, &mut report)?;
            self.phase(unit, SyncPhase::Done);
            return Ok(report);
        }

        self.phase(unit, SyncPhase::Diffing);
        let src_listing = unit.list(&unit.src)?;
        let dst_listing = unit.list(&unit.dst)?;
        let src_records = snapshot(&unit.src, &src_listing.files)?;
        let dst_records = snapshot(&unit.dst, &dst_listing.files)?;

        let classification =
            self.classifier
                .classify(&src_records, &dst_records, self.sync_deleted, |rel| {
                    rel.to_path(&unit.src).symlink_metadata().is_ok()
                });
        debug!(
            "{}: {} file(s) to sync, {} unchanged",
            unit.name,
            classification.pending(),
            classification.unchanged.len()
        );
        report.unchanged_files = classification.unchanged.len();
        for rel in &classification.unlisted {
            self.sink.emit(&SyncEvent::Unlisted { path: rel.clone() });
            report.unlisted_files += 1;
        }

        for folder in &src_listing.folders {
            let path = folder.to_path(&unit.dst);
            if !path.is_dir() {
                self.ops
                    .create_dir_all(&path)
                    .map_err(|e| self.failure(e))?;
            }
        }

        self.phase(unit, SyncPhase::BackingUp);
        for rel in &classification.deleted {
            self.checkpoint()?;
            match rotator {
                Some(rotator) => {
                    self.relocate(rotator, unit, rel, ChangeKind::Deleted, &mut report)?;
                    report.deleted_files += 1;
                }
                None => {
                    self.sink.emit(&SyncEvent::DeletionKept { path: rel.clone() });
                    report.deletions_kept += 1;
                }
            }
        }
        if let Some(rotator) = rotator {
            for rel in &classification.changed {
                self.checkpoint()?;
                self.relocate(rotator, unit, rel, ChangeKind::Changed, &mut report)?;
            }
        }

        self.phase(unit, SyncPhase::Mirroring);
        for rel in &classification.changed {
            self.checkpoint()?;
            self.copy_forward(unit, rel, ChangeKind::Changed, &mut report)?;
            report.changed_files += 1;
        }
        for rel in &classification.new {
            self.checkpoint()?;
            self.copy_forward(unit, rel, ChangeKind::New, &mut report)?;
            report.new_files += 1;
        }

        self.phase(unit, SyncPhase::Pruning);
        if let Some(rotator) = rotator {
            rotator.prune_runs().record(&mut report);
        }

        self.phase(unit, SyncPhase::Done);
        Ok(report)
    }

    /// First sync into a missing DST: copy everything, keep no history
    fn seed(&self, unit: &MirrorUnit, report: &mut SyncReport) -> Result<()> {
        self.sink.emit(&SyncEvent::Seeding {
            src: unit.src.clone(),
            dst: unit.dst.clone(),
        });

        let listing = unit.list(&unit.src)?;
        self.ops
            .create_dir_all(&unit.dst)
            .map_err(|e| self.failure(e))?;
        for folder in &listing.folders {
            self.ops
                .create_dir_all(&folder.to_path(&unit.dst))
                .map_err(|e| self.failure(e))?;
        }
        for rel in &listing.files {
            self.checkpoint()?;
            self.copy_forward(unit, rel, ChangeKind::New, report)?;
            report.new_files += 1;
        }

        report.seeded_units += 1;
        Ok(())
    }

    fn relocate(
        &self,
        rotator: &BackupRotator<'_>,
        unit: &MirrorUnit,
        rel: &RelPath,
        change: ChangeKind,
        report: &mut SyncReport,
    ) -> Result<()> {
        let relocation = rotator
            .relocate(&unit.dst, rel, change)
            .map_err(|e| self.failure(e))?;
        relocation.prune.record(report);
        report.backups_created += 1;
        Ok(())
    }

    fn copy_forward(
        &self,
        unit: &MirrorUnit,
        rel: &RelPath,
        change: ChangeKind,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.sink.emit(&SyncEvent::Mirrored {
            path: rel.clone(),
            change,
        });

        let target = rel.to_path(&unit.dst);
        let outcome = self
            .ops
            .copy_file(&rel.to_path(&unit.src), &target)
            .map_err(|e| self.failure(e))?;
        self.record_outcome(target, outcome, report);
        Ok(())
    }

    /// Contents are in place; a lost mtime or mode only warns
    fn record_outcome(&self, target: PathBuf, outcome: CopyOutcome, report: &mut SyncReport) {
        if let CopyOutcome::MetadataNotPreserved(error) = outcome {
            let event = SyncEvent::MetadataNotPreserved {
                path: target,
                error,
            };
            report.warnings.push(event.to_string());
            self.sink.emit(&event);
        }
    }

    /// Log full detail of a hard failure before it aborts the pass
    fn failure(&self, error: SyncError) -> SyncError {
        if let SyncError::Io { path, source } = &error {
            self.sink.emit(&SyncEvent::IoFailure {
                path: path.clone(),
                error: format!("{source:?}"),
            });
        }
        error
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn phase(&self, unit: &MirrorUnit, phase: SyncPhase) {
        self.sink.emit(&SyncEvent::Phase {
            unit: unit.name.clone(),
            phase,
        });
    }
}
