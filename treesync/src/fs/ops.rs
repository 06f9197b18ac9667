//! Mutating filesystem operations.
//!
//! All writes of a pass go through [`FsOps`] so that a dry run can skip every
//! mutation in one place while the callers still produce their full event trace.

use crate::fs::metadata::FileMetadata;
use crate::utils::{Result, SyncError};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Suffix of in-flight copies
pub const TEMP_SUFFIX: &str = ".treesync-tmp";

/// Result of a successful copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    /// Contents landed but mtime or permission bits could not be carried over
    MetadataNotPreserved(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsOps {
    dry_run: bool,
}

impl FsOps {
    pub fn new(dry_run: bool) -> Self {
        Self { dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Create a directory and any missing parents
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        if self.dry_run || path.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(path).map_err(|e| SyncError::io(path, e))
    }

    /// Copy file contents, then carry over modification time and permissions.
    ///
    /// Contents go to a temporary sibling that is renamed over `dst`, so DST
    /// never holds a partial or stale file after an `Ok`. Every failure up to
    /// the rename is a hard error; only the metadata step is downgraded.
    pub fn copy_file(&self, src: &Path, dst: &Path) -> Result<CopyOutcome> {
        if self.dry_run {
            return Ok(CopyOutcome::Copied);
        }

        let metadata = FileMetadata::from_path(src).map_err(|e| SyncError::io(src, e))?;
        write_replacing(src, dst)?;
        Ok(self.apply_metadata(&metadata, dst))
    }

    /// Stamp `dst` with the source's mtime and mode bits
    pub fn apply_metadata(&self, metadata: &FileMetadata, dst: &Path) -> CopyOutcome {
        if self.dry_run {
            return CopyOutcome::Copied;
        }
        match metadata.apply_to_path(dst) {
            Ok(()) => CopyOutcome::Copied,
            Err(e) => CopyOutcome::MetadataNotPreserved(e.to_string()),
        }
    }

    /// Move a file, falling back to copy + remove across filesystems
    pub fn move_file(&self, src: &Path, dst: &Path) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }

        match fs::rename(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                debug!(
                    "Rename across filesystems, copying instead: {} -> {}",
                    src.display(),
                    dst.display()
                );
                if let CopyOutcome::MetadataNotPreserved(reason) = self.copy_file(src, dst)? {
                    debug!("Backup copy without metadata {}: {}", dst.display(), reason);
                }
                fs::remove_file(src).map_err(|e| SyncError::io(src, e))
            }
            Err(e) => Err(SyncError::io(src, e)),
        }
    }

    pub fn remove_file(&self, path: &Path) -> io::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        fs::remove_file(path)
    }

    pub fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        fs::remove_dir_all(path)
    }
}

/// Write `src` into a temporary file next to `dst`, then rename it into place
fn write_replacing(src: &Path, dst: &Path) -> Result<()> {
    let temp_path = temp_sibling(dst);
    let written = write_temp(src, &temp_path)
        .and_then(|()| fs::rename(&temp_path, dst).map_err(|e| SyncError::io(dst, e)));
    if written.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    written
}

fn write_temp(src: &Path, temp_path: &Path) -> Result<()> {
    let mut reader = File::open(src).map_err(|e| SyncError::io(src, e))?;
    let mut temp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(temp_path)
        .map_err(|e| SyncError::io(temp_path, e))?;

    io::copy(&mut reader, &mut temp_file).map_err(|e| SyncError::io(temp_path, e))?;
    temp_file
        .sync_all()
        .map_err(|e| SyncError::io(temp_path, e))
}

/// `.<name>.<pid>.treesync-tmp` in the same directory, so the rename stays on one filesystem
fn temp_sibling(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    dst.with_file_name(format!(".{}.{}{}", name, std::process::id(), TEMP_SUFFIX))
}

fn is_cross_device(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}
