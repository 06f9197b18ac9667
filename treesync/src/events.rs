//! Sync events and the sinks that receive them.
//!
//! The engine never writes log output itself. Every action is described by a
//! [`SyncEvent`] handed to an [`EventSink`]; the caller decides whether events
//! end up in tracing, a per-job log file, JSON lines, or a test buffer.

use crate::executor::report::SyncReport;
use crate::fs::walker::RelPath;
use crate::sync::SyncPhase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Level;

/// Why a file is being copied or relocated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Changed,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::New => f.write_str("new"),
            ChangeKind::Changed => f.write_str("changed"),
            ChangeKind::Deleted => f.write_str("deleted"),
        }
    }
}

/// Event types emitted during a sync pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncEvent {
    /// Dry-run mode is active; nothing below is applied
    #[serde(rename = "job:dry_run")]
    DryRun,

    #[serde(rename = "job:started")]
    JobStarted {
        job: String,
        run: String,
        src: PathBuf,
        dst: PathBuf,
        bak: Option<PathBuf>,
        retention: String,
        sync_deleted: bool,
    },

    #[serde(rename = "job:finished")]
    JobFinished { job: String, report: SyncReport },

    /// One sync unit (the root files, or one subdirectory) begins
    #[serde(rename = "unit:started")]
    UnitStarted { unit: String },

    #[serde(rename = "unit:finished")]
    UnitFinished { unit: String },

    /// A unit was left alone because the include/exclude filter rejected it
    #[serde(rename = "unit:skipped")]
    UnitSkipped { unit: String },

    #[serde(rename = "unit:phase")]
    Phase { unit: String, phase: SyncPhase },

    /// DST did not exist; the whole SRC listing is copied
    #[serde(rename = "mirror:seeding")]
    Seeding { src: PathBuf, dst: PathBuf },

    /// A SRC file was copied over to DST
    #[serde(rename = "mirror:copied")]
    Mirrored { path: RelPath, change: ChangeKind },

    /// A DST file was moved into the backup tree
    #[serde(rename = "backup:created")]
    BackedUp {
        path: RelPath,
        change: ChangeKind,
        backup: PathBuf,
    },

    /// An old backup version (file or run folder) was removed
    #[serde(rename = "backup:pruned")]
    Pruned { version: PathBuf },

    #[serde(rename = "backup:prune_failed")]
    PruneFailed { version: PathBuf, error: String },

    /// The configured backup root is unusable; history is off for this unit
    #[serde(rename = "backup:disabled")]
    BackupDisabled { path: PathBuf, reason: String },

    /// A deleted file stays in DST because no backup root is available
    #[serde(rename = "mirror:deletion_kept")]
    DeletionKept { path: RelPath },

    /// A file missing from the SRC listing still exists in SRC; not deleted
    #[serde(rename = "mirror:unlisted")]
    Unlisted { path: RelPath },

    /// Contents were copied but mtime/permissions could not be carried over
    #[serde(rename = "mirror:metadata_not_preserved")]
    MetadataNotPreserved { path: PathBuf, error: String },

    /// A hard I/O failure that is about to abort the pass
    #[serde(rename = "io:failure")]
    IoFailure { path: PathBuf, error: String },

    #[serde(rename = "job:warning")]
    Warning { message: String },
}

impl SyncEvent {
    /// Severity used when routing the event to tracing
    pub fn level(&self) -> Level {
        match self {
            SyncEvent::Phase { .. } | SyncEvent::IoFailure { .. } => Level::DEBUG,
            SyncEvent::PruneFailed { .. }
            | SyncEvent::BackupDisabled { .. }
            | SyncEvent::DeletionKept { .. }
            | SyncEvent::Unlisted { .. }
            | SyncEvent::MetadataNotPreserved { .. }
            | SyncEvent::Warning { .. } => Level::WARN,
            _ => Level::INFO,
        }
    }

    /// Warnings the user must see even when logs are routed elsewhere
    pub fn is_user_warning(&self) -> bool {
        matches!(
            self,
            SyncEvent::BackupDisabled { .. }
                | SyncEvent::Warning { .. }
                | SyncEvent::MetadataNotPreserved { .. }
        )
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::DryRun => {
                write!(f, "DRY RUN: none of the actions below are actually performed")
            }
            SyncEvent::JobStarted {
                job,
                run,
                src,
                dst,
                bak,
                retention,
                sync_deleted,
            } => {
                let bak = bak
                    .as_ref()
                    .map(|p| format!("'{}'", p.display()))
                    .unwrap_or_else(|| "none".to_string());
                write!(
                    f,
                    "JOB = {job} ({run}) SRC = '{}' DST = '{}' BAK = {bak} num_bak = {retention} sync_deleted = {sync_deleted}",
                    src.display(),
                    dst.display()
                )
            }
            SyncEvent::JobFinished { job, report } => write!(f, "{job} finished: {report}"),
            SyncEvent::UnitStarted { unit } => write!(f, "{unit}:"),
            SyncEvent::UnitFinished { unit } => write!(f, "{unit} done"),
            SyncEvent::UnitSkipped { unit } => write!(f, "{unit}: skipped by filter"),
            SyncEvent::Phase { unit, phase } => write!(f, "{unit}: {phase:?}"),
            SyncEvent::Seeding { src, dst } => write!(
                f,
                " seeding '{}' with the whole of '{}'",
                dst.display(),
                src.display()
            ),
            SyncEvent::Mirrored { path, change } => {
                write!(f, " ({change}) '{path}' copying from SRC to DST")
            }
            SyncEvent::BackedUp {
                path,
                change,
                backup,
            } => write!(
                f,
                " ({change}) '{path}' moving from DST to BAK as '{}'",
                backup.display()
            ),
            SyncEvent::Pruned { version } => {
                write!(f, "   removing old BAK version '{}'", version.display())
            }
            SyncEvent::PruneFailed { version, error } => write!(
                f,
                "   could not remove old BAK version '{}': {error}",
                version.display()
            ),
            SyncEvent::BackupDisabled { path, reason } => write!(
                f,
                "backup disabled for '{}' ({reason}); overwritten files will NOT be recoverable",
                path.display()
            ),
            SyncEvent::DeletionKept { path } => {
                write!(f, " (deleted) '{path}' kept in DST, no backup location")
            }
            SyncEvent::Unlisted { path } => write!(
                f,
                " '{path}' exists in SRC but was not listed; not treated as deleted"
            ),
            SyncEvent::MetadataNotPreserved { path, error } => write!(
                f,
                "file metadata could not be copied to '{}': {error}",
                path.display()
            ),
            SyncEvent::IoFailure { path, error } => {
                write!(f, "I/O failure at '{}': {error}", path.display())
            }
            SyncEvent::Warning { message } => f.write_str(message),
        }
    }
}

/// Receiver of sync events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SyncEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: &SyncEvent) {
        (**self).emit(event)
    }
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn emit(&self, event: &SyncEvent) {
        (**self).emit(event)
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &SyncEvent) {}
}

/// Forwards events to `tracing` at their own severity
#[derive(Debug, Clone)]
pub struct TracingSink {
    job: String,
}

impl TracingSink {
    pub fn new(job: impl Into<String>) -> Self {
        Self { job: job.into() }
    }
}

impl EventSink for TracingSink {
    fn emit(&self, event: &SyncEvent) {
        let job = self.job.as_str();
        match event.level() {
            Level::DEBUG => tracing::debug!(job, "{}", event),
            Level::WARN => tracing::warn!(job, "{}", event),
            _ => tracing::info!(job, "{}", event),
        }
    }
}

/// Appends one plain line per event to a log file
pub struct LogFileSink {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl LogFileSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Conventional per-job log next to the destination: `<DST>_fsync.log`
    pub fn path_for_destination(dst: &Path) -> PathBuf {
        let mut name = dst.as_os_str().to_owned();
        name.push("_fsync.log");
        PathBuf::from(name)
    }
}

impl EventSink for LogFileSink {
    fn emit(&self, event: &SyncEvent) {
        if matches!(event, SyncEvent::Phase { .. }) {
            return;
        }
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let written = writeln!(writer, "{event}").and_then(|_| writer.flush());
        if let Err(e) = written {
            tracing::debug!("Failed to write log file {}: {}", self.path.display(), e);
        }
    }
}

/// Serializes each event as one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn emit(&self, event: &SyncEvent) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        let written = serde_json::to_writer(&mut *writer, event)
            .map_err(io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());
        if let Err(e) = written {
            tracing::debug!("Failed to write JSON event: {}", e);
        }
    }
}

/// Prints user-facing warnings on stderr
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrWarnings;

impl EventSink for StderrWarnings {
    fn emit(&self, event: &SyncEvent) {
        if event.is_user_warning() {
            eprintln!("[WARNING] {event}");
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &SyncEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Sends every event to each inner sink in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: &SyncEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}
