//! Sync job definition.
//!
//! A [`SyncJob`] is immutable once built and is validated up front, so a pass
//! never starts against a missing source or with trees nested in each other.

use crate::sync::classify::Tolerance;
use crate::utils::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Filter token standing for the root unit
pub const ROOT_TOKEN: &str = ".";

/// How many backup versions to keep per file (or per run folder)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetentionRepr", into = "RetentionRepr")]
pub enum Retention {
    Bounded(NonZeroUsize),
    Unbounded,
}

impl Retention {
    pub fn bounded(count: usize) -> Option<Self> {
        NonZeroUsize::new(count).map(Self::Bounded)
    }

    /// Maximum number of versions, `None` when unbounded
    pub fn limit(&self) -> Option<usize> {
        match self {
            Retention::Bounded(n) => Some(n.get()),
            Retention::Unbounded => None,
        }
    }
}

impl Default for Retention {
    fn default() -> Self {
        Self::Bounded(NonZeroUsize::new(5).unwrap_or(NonZeroUsize::MIN))
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retention::Bounded(n) => write!(f, "{n}"),
            Retention::Unbounded => f.write_str("unbounded"),
        }
    }
}

impl std::str::FromStr for Retention {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("unbounded") {
            return Ok(Self::Unbounded);
        }
        let count: usize = s
            .parse()
            .map_err(|_| format!("expected a positive integer or \"unbounded\", got {s:?}"))?;
        Self::bounded(count).ok_or_else(|| "retention count must be at least 1".to_string())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetentionRepr {
    Count(u64),
    Keyword(String),
}

impl TryFrom<RetentionRepr> for Retention {
    type Error = String;

    fn try_from(repr: RetentionRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            RetentionRepr::Count(n) => usize::try_from(n)
                .ok()
                .and_then(Retention::bounded)
                .ok_or_else(|| "retention count must be at least 1".to_string()),
            RetentionRepr::Keyword(word) => word.parse(),
        }
    }
}

impl From<Retention> for RetentionRepr {
    fn from(retention: Retention) -> Self {
        match retention {
            Retention::Bounded(n) => RetentionRepr::Count(n.get() as u64),
            Retention::Unbounded => RetentionRepr::Keyword("unbounded".to_string()),
        }
    }
}

/// Backup tree layout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VersioningStrategy {
    /// `<stem>_fsync<timestamp>_<.ext>` next to the file's mirrored location
    #[default]
    PerFile,
    /// One `<timestamp>_<user>` folder per pass holding every superseded file
    PerRun,
}

/// Which units a pass is split into
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// SRC is mirrored as one recursive unit
    #[default]
    WholeTree,
    /// Every immediate SRC subdirectory is its own unit, plus the root files
    PerSubdirectory,
    /// Only the files directly inside SRC
    RootOnly,
}

/// Subdirectory name filter; `"."` refers to the root unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubdirFilter {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl SubdirFilter {
    /// Include wins when both lists are given
    pub fn from_lists(include: Option<Vec<String>>, exclude: Option<Vec<String>>) -> Self {
        match (include, exclude) {
            (Some(include), exclude) => {
                if exclude.is_some_and(|e| !e.is_empty()) {
                    warn!("Both include and exclude given, ignoring exclude");
                }
                SubdirFilter::Include(include)
            }
            (None, Some(exclude)) => SubdirFilter::Exclude(exclude),
            (None, None) => SubdirFilter::All,
        }
    }

    pub fn admits(&self, name: &str) -> bool {
        match self {
            SubdirFilter::All => true,
            SubdirFilter::Include(names) => names.iter().any(|n| n == name),
            SubdirFilter::Exclude(names) => !names.iter().any(|n| n == name),
        }
    }

    pub fn admits_root(&self) -> bool {
        self.admits(ROOT_TOKEN)
    }

    fn names(&self) -> &[String] {
        match self {
            SubdirFilter::All => &[],
            SubdirFilter::Include(names) | SubdirFilter::Exclude(names) => names,
        }
    }
}

/// SRC, DST and optional BAK roots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub src: PathBuf,
    pub dst: PathBuf,
    pub bak: Option<PathBuf>,
}

impl SyncTarget {
    pub fn new(src: impl Into<PathBuf>, dst: impl Into<PathBuf>, bak: Option<PathBuf>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            bak,
        }
    }
}

/// A validated, immutable sync job
#[derive(Debug, Clone)]
pub struct SyncJob {
    name: String,
    target: SyncTarget,
    retention: Retention,
    versioning: VersioningStrategy,
    mode: SyncMode,
    filter: SubdirFilter,
    sync_deleted: bool,
    dry_run: bool,
    tolerance: Tolerance,
}

impl SyncJob {
    pub fn builder(name: impl Into<String>, target: SyncTarget) -> SyncJobBuilder {
        SyncJobBuilder {
            name: name.into(),
            target,
            retention: Retention::default(),
            versioning: VersioningStrategy::default(),
            mode: SyncMode::default(),
            filter: SubdirFilter::default(),
            sync_deleted: false,
            dry_run: false,
            tolerance: Tolerance::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &SyncTarget {
        &self.target
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    pub fn versioning(&self) -> VersioningStrategy {
        self.versioning
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn filter(&self) -> &SubdirFilter {
        &self.filter
    }

    pub fn sync_deleted(&self) -> bool {
        self.sync_deleted
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn tolerance(&self) -> Tolerance {
        self.tolerance
    }
}

#[derive(Debug, Clone)]
pub struct SyncJobBuilder {
    name: String,
    target: SyncTarget,
    retention: Retention,
    versioning: VersioningStrategy,
    mode: SyncMode,
    filter: SubdirFilter,
    sync_deleted: bool,
    dry_run: bool,
    tolerance: Tolerance,
}

impl SyncJobBuilder {
    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn versioning(mut self, versioning: VersioningStrategy) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn filter(mut self, filter: SubdirFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn sync_deleted(mut self, sync_deleted: bool) -> Self {
        self.sync_deleted = sync_deleted;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Validate paths and options and produce the job
    pub fn build(self) -> Result<SyncJob> {
        if self.name.trim().is_empty() {
            return Err(SyncError::Config("job name must not be empty".into()));
        }

        let SyncTarget { src, dst, bak } = &self.target;
        for path in std::iter::once(src).chain(Some(dst)).chain(bak.as_ref()) {
            if !path.is_absolute() {
                return Err(SyncError::Config(format!(
                    "path must be absolute: {}",
                    path.display()
                )));
            }
        }

        if !src.is_dir() {
            return Err(SyncError::InvalidDirectory(src.clone()));
        }
        if !dst.is_dir() {
            let parent_ok = dst.parent().is_some_and(Path::is_dir);
            if dst.exists() || !parent_ok {
                return Err(SyncError::InvalidDirectory(dst.clone()));
            }
        }

        let src_real = resolve(src);
        let dst_real = resolve(dst);
        if overlaps(&src_real, &dst_real) {
            return Err(SyncError::Config(format!(
                "SRC '{}' and DST '{}' must not contain each other",
                src.display(),
                dst.display()
            )));
        }
        if let Some(bak) = bak {
            let bak_real = resolve(bak);
            if overlaps(&bak_real, &src_real) || overlaps(&bak_real, &dst_real) {
                return Err(SyncError::Config(format!(
                    "BAK '{}' must lie outside SRC and DST",
                    bak.display()
                )));
            }
        }

        for name in self.filter.names() {
            if name.is_empty() || (name != ROOT_TOKEN && name.contains(['/', '\\'])) {
                return Err(SyncError::Config(format!(
                    "filter entries must be plain subdirectory names, got {name:?}"
                )));
            }
        }

        Ok(SyncJob {
            name: self.name,
            target: self.target,
            retention: self.retention,
            versioning: self.versioning,
            mode: self.mode,
            filter: self.filter,
            sync_deleted: self.sync_deleted,
            dry_run: self.dry_run,
            tolerance: self.tolerance,
        })
    }
}

/// Canonical form of a path that may not exist yet
fn resolve(path: &Path) -> PathBuf {
    if let Ok(real) = path.canonicalize() {
        return real;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => resolve(parent).join(name),
        _ => path.to_path_buf(),
    }
}

fn overlaps(a: &Path, b: &Path) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn layout() -> (TempDir, PathBuf, PathBuf, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("SRC");
        fs::create_dir(&src).unwrap();
        let dst = temp_dir.path().join("DST");
        let bak = temp_dir.path().join("BAK");
        (temp_dir, src, dst, bak)
    }

    #[test]
    fn test_build_valid_job() {
        let (_tmp, src, dst, bak) = layout();
        let job = SyncJob::builder("data", SyncTarget::new(&src, &dst, Some(bak)))
            .retention(Retention::bounded(2).unwrap())
            .mode(SyncMode::PerSubdirectory)
            .sync_deleted(true)
            .build()
            .unwrap();

        assert_eq!(job.name(), "data");
        assert_eq!(job.retention().limit(), Some(2));
        assert_eq!(job.mode(), SyncMode::PerSubdirectory);
        assert!(job.sync_deleted());
        assert!(!job.dry_run());
    }

    #[test]
    fn test_missing_source_rejected() {
        let (tmp, _src, dst, _bak) = layout();
        let missing = tmp.path().join("nope");
        let err = SyncJob::builder("x", SyncTarget::new(&missing, &dst, None))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidDirectory(p) if p == missing));
    }

    #[test]
    fn test_destination_parent_must_exist() {
        let (tmp, src, _dst, _bak) = layout();
        let dst = tmp.path().join("missing/DST");
        let err = SyncJob::builder("x", SyncTarget::new(&src, &dst, None))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidDirectory(_)));
    }

    #[test]
    fn test_relative_paths_rejected() {
        let err = SyncJob::builder("x", SyncTarget::new("SRC", "DST", None))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_nested_trees_rejected() {
        let (_tmp, src, dst, _bak) = layout();
        let inside = src.join("mirror");
        assert!(SyncJob::builder("x", SyncTarget::new(&src, &inside, None))
            .build()
            .is_err());
        assert!(SyncJob::builder("x", SyncTarget::new(&src, &src, None))
            .build()
            .is_err());
        assert!(
            SyncJob::builder("x", SyncTarget::new(&src, &dst, Some(dst.join(".bak"))))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_unusable_backup_parent_is_not_fatal() {
        let (tmp, src, dst, _bak) = layout();
        let bak = tmp.path().join("no/such/BAK");
        assert!(SyncJob::builder("x", SyncTarget::new(&src, &dst, Some(bak)))
            .build()
            .is_ok());
    }

    #[test]
    fn test_filter_rules() {
        let filter = SubdirFilter::from_lists(
            Some(vec!["A".into(), ".".into()]),
            Some(vec!["A".into()]),
        );
        assert!(filter.admits("A"));
        assert!(!filter.admits("B"));
        assert!(filter.admits_root());

        let filter = SubdirFilter::from_lists(None, Some(vec!["old".into()]));
        assert!(!filter.admits("old"));
        assert!(filter.admits("new"));
        assert!(filter.admits_root());

        assert!(!SubdirFilter::Include(vec!["A".into()]).admits_root());
        assert!(!SubdirFilter::Exclude(vec![".".into()]).admits_root());
    }

    #[test]
    fn test_filter_names_validated() {
        let (_tmp, src, dst, _bak) = layout();
        let err = SyncJob::builder("x", SyncTarget::new(&src, &dst, None))
            .filter(SubdirFilter::Exclude(vec!["a/b".into()]))
            .build()
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_retention_parsing() {
        assert_eq!("3".parse::<Retention>().unwrap().limit(), Some(3));
        assert_eq!("unbounded".parse::<Retention>().unwrap(), Retention::Unbounded);
        assert!("0".parse::<Retention>().is_err());
        assert!("many".parse::<Retention>().is_err());
        assert_eq!(Retention::default().limit(), Some(5));
    }
}
