//! Directory traversal producing relative folder and file listings.
//!
//! Listings are relative to the walked root and use `/` as separator so that
//! SRC and DST listings compare equal regardless of where the roots live.

use crate::utils::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Path relative to a tree root, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    /// Build from a relative native path. Returns `None` for paths that are
    /// empty, absolute, contain `..`, or are not valid UTF-8.
    pub fn from_path(rel: &Path) -> Option<Self> {
        let mut parts = Vec::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_str()?),
                Component::CurDir => {}
                _ => return None,
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(Self(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Parent folder, `None` for entries directly under the root
    pub fn parent(&self) -> Option<RelPath> {
        self.0.rsplit_once('/').map(|(parent, _)| Self(parent.to_string()))
    }

    /// Resolve against a root directory
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in self.0.split('/') {
            path.push(part);
        }
        path
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelPath {
    fn from(value: &str) -> Self {
        Self(value.trim_matches('/').to_string())
    }
}

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Maximum depth below the root (None = unlimited)
    pub max_depth: Option<usize>,
}

impl WalkOptions {
    /// Only the entries directly inside the root
    pub fn shallow() -> Self {
        Self {
            max_depth: Some(1),
        }
    }
}

/// Folders and files found under a root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeListing {
    /// Subfolders, parent before child, siblings sorted by name
    pub folders: Vec<RelPath>,

    /// Files in the same traversal order
    pub files: Vec<RelPath>,
}

enum EntryKind {
    Folder,
    File,
    Skip,
}

fn classify_entry(entry: &DirEntry) -> EntryKind {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        return EntryKind::Folder;
    }
    if file_type.is_file() {
        return EntryKind::File;
    }
    if file_type.is_symlink() {
        // Resolve to decide; links to folders and dangling links are not mirrored
        return match std::fs::metadata(entry.path()) {
            Ok(resolved) if resolved.is_file() => EntryKind::File,
            Ok(_) => {
                debug!("Skipping symlink to directory: {}", entry.path().display());
                EntryKind::Skip
            }
            Err(_) => {
                debug!("Skipping broken symlink: {}", entry.path().display());
                EntryKind::Skip
            }
        };
    }
    debug!("Skipping special file: {}", entry.path().display());
    EntryKind::Skip
}

fn ensure_directory(root: &Path) -> Result<()> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(SyncError::InvalidDirectory(root.to_path_buf()))
    }
}

/// Walk a directory tree and collect relative folders and files
///
/// # Arguments
/// * `root` - Root directory to start walking from
/// * `options` - Walking options (depth); symlinks are never followed
///
/// # Returns
/// * `Ok(TreeListing)` - Folders and files found, empty for an empty root
/// * `Err(SyncError::InvalidDirectory)` - If the root is missing or not a directory
pub fn walk_directory(root: &Path, options: &WalkOptions) -> Result<TreeListing> {
    ensure_directory(root)?;

    let mut listing = TreeListing::default();

    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    for entry in walker {
        let entry = entry?;

        let kind = classify_entry(&entry);
        if matches!(kind, EntryKind::Skip) {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(rel) = RelPath::from_path(relative) else {
            warn!("Skipping entry with non UTF-8 name: {}", entry.path().display());
            continue;
        };

        match kind {
            EntryKind::Folder => listing.folders.push(rel),
            EntryKind::File => listing.files.push(rel),
            EntryKind::Skip => {}
        }
    }

    Ok(listing)
}

/// Full recursive listing of a tree
pub fn list_tree(root: &Path) -> Result<TreeListing> {
    walk_directory(root, &WalkOptions::default())
}

/// Files directly inside the root; subfolders are not descended into
pub fn list_files_shallow(root: &Path) -> Result<Vec<RelPath>> {
    Ok(walk_directory(root, &WalkOptions::shallow())?.files)
}

/// Immediate subdirectory names of a root, sorted
pub fn list_subdirectories(root: &Path) -> Result<Vec<String>> {
    Ok(walk_directory(root, &WalkOptions::shallow())?
        .folders
        .into_iter()
        .map(|rel| rel.as_str().to_string())
        .collect())
}
