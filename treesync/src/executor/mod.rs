//! Sync job executor - Orchestrates one synchronization pass.
//!
//! A pass is split into units according to the job's mode:
//! - whole tree: SRC itself, recursively
//! - root only: the files directly inside SRC
//! - per subdirectory: the root files plus each immediate SRC subdirectory,
//!   every one with its own DST and BAK subtree
//!
//! Each unit runs through the tree mirror with its own backup rotator.

pub mod context;
pub mod report;

use crate::events::{EventSink, SyncEvent};
use crate::fs::ops::FsOps;
use crate::fs::walker::list_subdirectories;
use crate::job::{SyncJob, SyncMode};
use crate::sync::classify::Classifier;
use crate::sync::mirror::{MirrorUnit, TreeMirror};
use crate::sync::rotate::{establish_backup_root, establish_unit_root, BackupRotator};
use crate::sync::SyncPhase;
use crate::utils::{Result, SyncError};
use context::RunContext;
use report::SyncReport;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Unit name for the loose files of the SRC root
pub const ROOT_UNIT: &str = "_ROOT_";

/// Main sync executor
pub struct SyncExecutor<'a> {
    job: &'a SyncJob,
    sink: &'a dyn EventSink,
    cancel_token: CancellationToken,
}

impl<'a> SyncExecutor<'a> {
    /// Create a new sync executor (no cancellation support)
    pub fn new(job: &'a SyncJob, sink: &'a dyn EventSink) -> Self {
        Self {
            job,
            sink,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Create a new sync executor that stops between files once `cancel_token` fires
    pub fn with_cancel(
        job: &'a SyncJob,
        sink: &'a dyn EventSink,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            job,
            sink,
            cancel_token,
        }
    }

    /// Execute one pass of the job
    pub fn run(&self, run: &RunContext) -> Result<SyncReport> {
        let job = self.job;
        let target = job.target();
        let ops = FsOps::new(job.dry_run());
        let mut report = SyncReport::default();

        info!(
            "Starting sync job: {} (mode: {:?}, run: {})",
            job.name(),
            job.mode(),
            run.tag()
        );

        if ops.is_dry_run() {
            self.sink.emit(&SyncEvent::DryRun);
        }
        self.job_phase(SyncPhase::Validating);
        validate_roots(&target.src, &target.dst)?;

        self.sink.emit(&SyncEvent::JobStarted {
            job: job.name().to_string(),
            run: run.tag(),
            src: target.src.clone(),
            dst: target.dst.clone(),
            bak: target.bak.clone(),
            retention: job.retention().to_string(),
            sync_deleted: job.sync_deleted(),
        });
        if job.sync_deleted() {
            self.warn(
                "sync_deleted is not recommended if multiple machines or jobs use DST",
                &mut report,
            );
        }

        let bak_root = establish_backup_root(target.bak.as_deref(), &ops, self.sink, &mut report);

        match job.mode() {
            SyncMode::WholeTree => {
                let unit = MirrorUnit {
                    name: unit_name(&target.src),
                    src: target.src.clone(),
                    dst: target.dst.clone(),
                    recursive: true,
                };
                if job.filter().admits_root() {
                    self.run_unit(&unit, bak_root, Vec::new(), run, &ops, &mut report)?;
                } else {
                    self.skip_unit(&unit.name, &mut report);
                }
            }
            SyncMode::RootOnly => {
                let unit = root_unit(&target.src, &target.dst);
                self.run_unit(&unit, bak_root, Vec::new(), run, &ops, &mut report)?;
            }
            SyncMode::PerSubdirectory => {
                let subdirs = list_subdirectories(&target.src)?;
                if job.filter().admits_root() {
                    // BAK/<subdir> holds another unit's history, not a run folder
                    let mut unit_roots = subdirs.clone();
                    if target.dst.is_dir() {
                        unit_roots.extend(list_subdirectories(&target.dst)?);
                    }
                    let unit = root_unit(&target.src, &target.dst);
                    self.run_unit(&unit, bak_root.clone(), unit_roots, run, &ops, &mut report)?;
                } else {
                    self.skip_unit(ROOT_UNIT, &mut report);
                }

                for name in subdirs {
                    if !job.filter().admits(&name) {
                        self.skip_unit(&name, &mut report);
                        continue;
                    }
                    let unit = MirrorUnit {
                        name: name.clone(),
                        src: target.src.join(&name),
                        dst: target.dst.join(&name),
                        recursive: true,
                    };
                    let unit_bak = bak_root.as_deref().and_then(|root| {
                        establish_unit_root(root, &name, &ops, self.sink, &mut report)
                    });
                    self.run_unit(&unit, unit_bak, Vec::new(), run, &ops, &mut report)?;
                }
            }
        }

        self.job_phase(SyncPhase::Done);
        self.sink.emit(&SyncEvent::JobFinished {
            job: job.name().to_string(),
            report: report.clone(),
        });
        info!("Sync job {} completed: {}", job.name(), report);

        Ok(report)
    }

    fn run_unit(
        &self,
        unit: &MirrorUnit,
        bak: Option<PathBuf>,
        protected: Vec<String>,
        run: &RunContext,
        ops: &FsOps,
        report: &mut SyncReport,
    ) -> Result<()> {
        if self.cancel_token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        self.sink.emit(&SyncEvent::UnitStarted {
            unit: unit.name.clone(),
        });

        let rotator = bak.map(|root| {
            BackupRotator::new(
                root,
                self.job.versioning(),
                self.job.retention(),
                run,
                *ops,
                self.sink,
            )
            .protecting(protected)
        });
        let mirror = TreeMirror::new(
            Classifier::new(self.job.tolerance()),
            self.job.sync_deleted(),
            *ops,
            self.sink,
            &self.cancel_token,
        );
        report.absorb(mirror.run(unit, rotator.as_ref())?);

        self.sink.emit(&SyncEvent::UnitFinished {
            unit: unit.name.clone(),
        });
        Ok(())
    }

    fn skip_unit(&self, name: &str, report: &mut SyncReport) {
        self.sink.emit(&SyncEvent::UnitSkipped {
            unit: name.to_string(),
        });
        report.skipped_units += 1;
    }

    fn warn(&self, message: &str, report: &mut SyncReport) {
        report.warnings.push(message.to_string());
        self.sink.emit(&SyncEvent::Warning {
            message: message.to_string(),
        });
    }

    fn job_phase(&self, phase: SyncPhase) {
        self.sink.emit(&SyncEvent::Phase {
            unit: self.job.name().to_string(),
            phase,
        });
    }
}

/// SRC must still be a directory and DST (or its parent) must be reachable
fn validate_roots(src: &Path, dst: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(SyncError::InvalidDirectory(src.to_path_buf()));
    }
    if !dst.is_dir() && !dst.parent().is_some_and(Path::is_dir) {
        return Err(SyncError::InvalidDirectory(dst.to_path_buf()));
    }
    Ok(())
}

fn root_unit(src: &Path, dst: &Path) -> MirrorUnit {
    MirrorUnit {
        name: ROOT_UNIT.to_string(),
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        recursive: false,
    }
}

fn unit_name(src: &Path) -> String {
    src.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| ROOT_UNIT.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::job::{Retention, SubdirFilter, SyncTarget, VersioningStrategy};
    use chrono::{NaiveDate, NaiveDateTime};
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn layout() -> (TempDir, PathBuf, PathBuf, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("local");
        let dst = temp_dir.path().join("external");
        let bak = temp_dir.path().join(".external");
        fs::create_dir_all(src.join("Project0/Data")).unwrap();
        fs::create_dir_all(src.join("Project_old")).unwrap();
        fs::write(src.join("notes.txt"), "notes").unwrap();
        fs::write(src.join("Project0/Data/file0.dat"), "v0").unwrap();
        fs::write(src.join("Project_old/file1.dat"), "old").unwrap();
        (temp_dir, src, dst, bak)
    }

    #[test]
    fn test_per_subdirectory_with_exclude() -> Result<()> {
        let (_tmp, src, dst, bak) = layout();
        let job = SyncJob::builder("projects", SyncTarget::new(&src, &dst, Some(bak.clone())))
            .mode(SyncMode::PerSubdirectory)
            .filter(SubdirFilter::Exclude(vec!["Project_old".into()]))
            .retention(Retention::bounded(2).unwrap())
            .build()?;

        let sink = MemorySink::new();
        let report = SyncExecutor::new(&job, &sink).run(&RunContext::start())?;

        assert_eq!(report.units, 2);
        assert_eq!(report.skipped_units, 1);
        assert!(dst.join("notes.txt").is_file());
        assert!(dst.join("Project0/Data/file0.dat").is_file());
        assert!(!dst.join("Project_old").exists());
        assert!(bak.join("Project0").is_dir());
        assert!(!bak.join("Project_old").exists());
        assert!(sink.events().contains(&SyncEvent::UnitSkipped {
            unit: "Project_old".into()
        }));
        Ok(())
    }

    #[test]
    fn test_subdirectory_named_like_run_tag_keeps_its_history() -> Result<()> {
        let (_tmp, src, dst, bak) = layout();
        let odd = "2024-01-01_000000_x";
        fs::create_dir_all(src.join(odd)).unwrap();
        fs::write(src.join(odd).join("report.txt"), "r").unwrap();
        let job = SyncJob::builder("projects", SyncTarget::new(&src, &dst, Some(bak.clone())))
            .mode(SyncMode::PerSubdirectory)
            .versioning(VersioningStrategy::PerRun)
            .retention(Retention::bounded(1).unwrap())
            .build()?;
        let sink = MemorySink::new();

        SyncExecutor::new(&job, &sink).run(&RunContext::new(at(10, 0), "alice"))?;
        assert!(bak.join(odd).is_dir());

        fs::write(src.join("notes.txt"), "notes v2").unwrap();
        let later = SystemTime::now() + Duration::from_secs(60);
        fs::File::options()
            .write(true)
            .open(src.join("notes.txt"))
            .unwrap()
            .set_modified(later)
            .unwrap();
        let report = SyncExecutor::new(&job, &sink).run(&RunContext::new(at(10, 5), "alice"))?;

        assert_eq!(report.changed_files, 1);
        assert!(bak.join("2024-03-01_100500_alice/notes.txt").is_file());
        assert!(bak.join(odd).is_dir());
        assert!(dst.join(odd).join("report.txt").is_file());
        Ok(())
    }

    #[test]
    fn test_include_without_root_token_skips_root_files() -> Result<()> {
        let (_tmp, src, dst, _bak) = layout();
        let job = SyncJob::builder("projects", SyncTarget::new(&src, &dst, None))
            .mode(SyncMode::PerSubdirectory)
            .filter(SubdirFilter::Include(vec!["Project0".into()]))
            .build()?;

        let report = SyncExecutor::new(&job, &MemorySink::new()).run(&RunContext::start())?;

        assert_eq!(report.units, 1);
        assert_eq!(report.skipped_units, 2);
        assert!(dst.join("Project0/Data/file0.dat").is_file());
        assert!(!dst.join("notes.txt").exists());
        Ok(())
    }

    #[test]
    fn test_root_only_mode() -> Result<()> {
        let (_tmp, src, dst, bak) = layout();
        let job = SyncJob::builder("root", SyncTarget::new(&src, &dst, Some(bak)))
            .mode(SyncMode::RootOnly)
            .versioning(VersioningStrategy::PerRun)
            .build()?;

        let report = SyncExecutor::new(&job, &MemorySink::new()).run(&RunContext::start())?;

        assert_eq!(report.new_files, 1);
        assert!(dst.join("notes.txt").is_file());
        assert!(!dst.join("Project0").exists());
        Ok(())
    }

    #[test]
    fn test_whole_tree_excluded_by_root_token() -> Result<()> {
        let (_tmp, src, dst, _bak) = layout();
        let job = SyncJob::builder("data", SyncTarget::new(&src, &dst, None))
            .filter(SubdirFilter::Exclude(vec![".".into()]))
            .build()?;

        let report = SyncExecutor::new(&job, &MemorySink::new()).run(&RunContext::start())?;

        assert_eq!(report.units, 0);
        assert_eq!(report.skipped_units, 1);
        assert!(!dst.exists());
        Ok(())
    }

    #[test]
    fn test_source_removed_after_validation() -> Result<()> {
        let (_tmp, src, dst, _bak) = layout();
        let job = SyncJob::builder("data", SyncTarget::new(&src, &dst, None)).build()?;
        fs::remove_dir_all(&src).unwrap();

        let result = SyncExecutor::new(&job, &MemorySink::new()).run(&RunContext::start());
        assert!(matches!(result, Err(SyncError::InvalidDirectory(_))));
        Ok(())
    }

    #[test]
    fn test_cancelled_job_stops() -> Result<()> {
        let (_tmp, src, dst, _bak) = layout();
        let job = SyncJob::builder("data", SyncTarget::new(&src, &dst, None)).build()?;
        let token = CancellationToken::new();
        token.cancel();

        let sink = MemorySink::new();
        let result = SyncExecutor::with_cancel(&job, &sink, token).run(&RunContext::start());

        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(!dst.exists());
        Ok(())
    }

    #[test]
    fn test_sync_deleted_warns() -> Result<()> {
        let (_tmp, src, dst, _bak) = layout();
        let job = SyncJob::builder("data", SyncTarget::new(&src, &dst, None))
            .sync_deleted(true)
            .build()?;

        let report = SyncExecutor::new(&job, &MemorySink::new()).run(&RunContext::start())?;
        assert_eq!(report.warnings.len(), 1);
        Ok(())
    }
}
