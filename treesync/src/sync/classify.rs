//! Change detection between a SRC and a DST listing.
//!
//! Uses modification time only (same heuristic as rsync's quick check, minus
//! the size). SRC counts as changed when it is newer than DST by more than the
//! tolerance, which absorbs the precision lost when a filesystem copies mtimes.

use crate::fs::metadata::FileRecord;
use crate::fs::walker::RelPath;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Smallest accepted tolerance
pub const MIN_TOLERANCE: Duration = Duration::from_secs(1);

/// Minimum mtime delta before a SRC file counts as changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tolerance(Duration);

impl Tolerance {
    /// Values below one second are raised to one second
    pub fn new(margin: Duration) -> Self {
        Self(margin.max(MIN_TOLERANCE))
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for Tolerance {
    fn default() -> Self {
        Self(MIN_TOLERANCE)
    }
}

/// Disjoint per-file decisions for one sync unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// In SRC, not in DST
    pub new: Vec<RelPath>,
    /// In both, SRC newer beyond tolerance
    pub changed: Vec<RelPath>,
    /// In DST only (deletion tracking on)
    pub deleted: Vec<RelPath>,
    /// In both, not newer in SRC
    pub unchanged: Vec<RelPath>,
    /// In DST only, yet present on disk in SRC although the SRC listing missed it
    pub unlisted: Vec<RelPath>,
}

impl Classification {
    /// Files that need a copy or a move
    pub fn pending(&self) -> usize {
        self.new.len() + self.changed.len() + self.deleted.len()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    tolerance: Tolerance,
}

impl Classifier {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    /// True when `src` is later than `dst` by more than the tolerance
    pub fn is_newer(&self, src: SystemTime, dst: SystemTime) -> bool {
        match dst.checked_add(self.tolerance.as_duration()) {
            Some(limit) => src > limit,
            None => false,
        }
    }

    /// Classify every file of both listings.
    ///
    /// `src_exists` is consulted before calling a DST-only file deleted; a path
    /// that exists in SRC but was missing from its listing is reported as
    /// unlisted instead, so filtering or traversal gaps never delete data.
    pub fn classify<F>(
        &self,
        src: &[FileRecord],
        dst: &[FileRecord],
        track_deletions: bool,
        src_exists: F,
    ) -> Classification
    where
        F: Fn(&RelPath) -> bool,
    {
        let dst_times: HashMap<&RelPath, SystemTime> =
            dst.iter().map(|r| (&r.path, r.modified)).collect();
        let src_paths: HashSet<&RelPath> = src.iter().map(|r| &r.path).collect();

        let mut result = Classification::default();

        for record in src {
            match dst_times.get(&record.path) {
                None => result.new.push(record.path.clone()),
                Some(&dst_time) if self.is_newer(record.modified, dst_time) => {
                    result.changed.push(record.path.clone())
                }
                Some(&dst_time) => {
                    if dst_time > record.modified {
                        debug!("DST copy is newer than SRC, leaving it: {}", record.path);
                    }
                    result.unchanged.push(record.path.clone())
                }
            }
        }

        if track_deletions {
            for record in dst {
                if src_paths.contains(&record.path) {
                    continue;
                }
                if src_exists(&record.path) {
                    result.unlisted.push(record.path.clone());
                } else {
                    result.deleted.push(record.path.clone());
                }
            }
        }

        result
    }
}
