//! File metadata used for change detection and preserved across copies.

use crate::fs::walker::RelPath;
use crate::utils::{Result, SyncError};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// A listed file together with its modification time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: RelPath,
    pub modified: SystemTime,
}

impl FileRecord {
    pub fn new(path: impl Into<RelPath>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            modified,
        }
    }
}

/// Read modification times for every listed file under `root`
pub fn snapshot(root: &Path, files: &[RelPath]) -> Result<Vec<FileRecord>> {
    files
        .iter()
        .map(|rel| {
            let path = rel.to_path(root);
            let modified = fs::metadata(&path)
                .and_then(|m| m.modified())
                .map_err(|e| SyncError::io(&path, e))?;
            Ok(FileRecord {
                path: rel.clone(),
                modified,
            })
        })
        .collect()
}

/// Metadata carried from a source file onto its copy
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time
    pub modified: SystemTime,

    /// File permissions (Unix mode bits)
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified: metadata.modified()?,
            permissions,
        })
    }

    /// Apply modification time and permissions to a file
    pub fn apply_to_path(&self, path: &Path) -> std::io::Result<()> {
        // futimens only needs ownership, so read-only copies can still be stamped
        #[cfg(unix)]
        let file = fs::File::open(path)?;
        #[cfg(not(unix))]
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_modified(self.modified)?;
        drop(file);

        #[cfg(unix)]
        if let Some(mode) = self.permissions {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }

        Ok(())
    }
}
