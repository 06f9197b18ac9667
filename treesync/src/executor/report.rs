//! Summary of a sync pass.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counts accumulated over every unit of a pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub units: usize,
    pub seeded_units: usize,
    pub skipped_units: usize,
    pub new_files: usize,
    pub changed_files: usize,
    pub deleted_files: usize,
    pub unchanged_files: usize,
    /// Present in SRC but missing from its listing, left alone
    pub unlisted_files: usize,
    /// Deleted in SRC but kept in DST for lack of a backup root
    pub deletions_kept: usize,
    pub backups_created: usize,
    pub versions_pruned: usize,
    pub prune_failures: usize,
    /// Messages the user has to see
    pub warnings: Vec<String>,
}

impl SyncReport {
    /// Merge the counts of another (unit) report into this one
    pub fn absorb(&mut self, other: SyncReport) {
        self.units += other.units;
        self.seeded_units += other.seeded_units;
        self.skipped_units += other.skipped_units;
        self.new_files += other.new_files;
        self.changed_files += other.changed_files;
        self.deleted_files += other.deleted_files;
        self.unchanged_files += other.unchanged_files;
        self.unlisted_files += other.unlisted_files;
        self.deletions_kept += other.deletions_kept;
        self.backups_created += other.backups_created;
        self.versions_pruned += other.versions_pruned;
        self.prune_failures += other.prune_failures;
        self.warnings.extend(other.warnings);
    }

    /// Files copied or moved during the pass
    pub fn files_touched(&self) -> usize {
        self.new_files + self.changed_files + self.deleted_files
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} new, {} changed, {} deleted, {} unchanged, {} backed up, {} pruned",
            self.new_files,
            self.changed_files,
            self.deleted_files,
            self.unchanged_files,
            self.backups_created,
            self.versions_pruned
        )?;
        if self.prune_failures > 0 {
            write!(f, ", {} prune failures", self.prune_failures)?;
        }
        if !self.warnings.is_empty() {
            write!(f, ", {} warnings", self.warnings.len())?;
        }
        Ok(())
    }
}
