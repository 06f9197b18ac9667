//! End-to-end passes over real temporary trees.

use chrono::NaiveDate;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use treesync::events::{JsonLinesSink, MemorySink};
use treesync::fs::walker::list_tree;
use treesync::job::SubdirFilter;
use treesync::{
    Retention, RunContext, SyncEvent, SyncExecutor, SyncJob, SyncMode, SyncReport, SyncTarget,
    VersioningStrategy,
};

struct Trees {
    _tmp: TempDir,
    src: PathBuf,
    dst: PathBuf,
    bak: PathBuf,
}

impl Trees {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("SRC");
        let dst = tmp.path().join("DST");
        let bak = tmp.path().join("BAK");
        fs::create_dir(&src).unwrap();
        Self {
            _tmp: tmp,
            src,
            dst,
            bak,
        }
    }

    fn target(&self) -> SyncTarget {
        SyncTarget::new(&self.src, &self.dst, Some(self.bak.clone()))
    }
}

fn write(root: &Path, rel: &str, content: &str, secs: u64) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

/// Relative path -> contents of every file under `root`
fn tree(root: &Path) -> BTreeMap<String, String> {
    if !root.exists() {
        return BTreeMap::new();
    }
    list_tree(root)
        .unwrap()
        .files
        .into_iter()
        .map(|rel| {
            let content = fs::read_to_string(rel.to_path(root)).unwrap();
            (rel.as_str().to_string(), content)
        })
        .collect()
}

fn entries(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn run_at(minute: u32) -> RunContext {
    let started = NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(10, minute, 0)
        .unwrap();
    RunContext::new(started, "alice")
}

fn run(job: &SyncJob, context: &RunContext) -> (SyncReport, Vec<SyncEvent>) {
    let sink = MemorySink::new();
    let report = SyncExecutor::new(job, &sink).run(context).unwrap();
    (report, sink.events())
}

fn file_operations(events: &[SyncEvent]) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(
                e,
                SyncEvent::Mirrored { .. } | SyncEvent::BackedUp { .. } | SyncEvent::Pruned { .. }
            )
        })
        .count()
}

#[test]
fn unchanged_tree_needs_no_operations() {
    let trees = Trees::new();
    for root in [&trees.src, &trees.dst] {
        write(root, "a.txt", "a", 100);
        write(root, "docs/b.txt", "b", 100);
    }
    let job = SyncJob::builder("data", trees.target()).build().unwrap();

    let (report, events) = run(&job, &run_at(0));

    assert_eq!(file_operations(&events), 0);
    assert_eq!(report.unchanged_files, 2);
    assert_eq!(report.files_touched(), 0);
    assert_eq!(tree(&trees.bak), BTreeMap::new());
}

#[test]
fn new_file_is_copied_without_backup() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "a", 100);
    write(&trees.src, "docs/new.txt", "fresh", 100);
    write(&trees.dst, "a.txt", "a", 100);
    let job = SyncJob::builder("data", trees.target()).build().unwrap();

    let (report, events) = run(&job, &run_at(0));

    assert_eq!(report.new_files, 1);
    assert_eq!(report.backups_created, 0);
    assert_eq!(file_operations(&events), 1);
    assert_eq!(
        tree(&trees.dst),
        entries(&[("a.txt", "a"), ("docs/new.txt", "fresh")])
    );
    assert_eq!(tree(&trees.bak), BTreeMap::new());
}

#[test]
fn changed_file_keeps_previous_version() {
    let trees = Trees::new();
    write(&trees.src, "docs/report.txt", "new", 200);
    write(&trees.dst, "docs/report.txt", "old", 100);
    let job = SyncJob::builder("data", trees.target()).build().unwrap();

    let (report, _) = run(&job, &run_at(0));

    assert_eq!(report.changed_files, 1);
    assert_eq!(report.backups_created, 1);
    assert_eq!(tree(&trees.dst), entries(&[("docs/report.txt", "new")]));
    assert_eq!(
        tree(&trees.bak),
        entries(&[("docs/report_fsync2024-03-01_100000_.txt", "old")])
    );
    let mirrored = fs::metadata(trees.dst.join("docs/report.txt"))
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(mirrored, SystemTime::UNIX_EPOCH + Duration::from_secs(200));
}

#[test]
fn older_source_is_left_alone() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "src", 100);
    write(&trees.dst, "a.txt", "edited in dst", 500);
    let job = SyncJob::builder("data", trees.target()).build().unwrap();

    let (report, _) = run(&job, &run_at(0));

    assert_eq!(report.unchanged_files, 1);
    assert_eq!(tree(&trees.dst), entries(&[("a.txt", "edited in dst")]));
}

#[test]
fn retention_bounds_file_versions() {
    let trees = Trees::new();
    let job = SyncJob::builder("data", trees.target())
        .retention(Retention::bounded(2).unwrap())
        .build()
        .unwrap();

    for pass in 0..4u32 {
        write(&trees.src, "a.txt", &format!("v{pass}"), 100 * (u64::from(pass) + 1));
        run(&job, &run_at(pass));
    }

    assert_eq!(tree(&trees.dst), entries(&[("a.txt", "v3")]));
    assert_eq!(
        tree(&trees.bak),
        entries(&[
            ("a_fsync2024-03-01_100200_.txt", "v1"),
            ("a_fsync2024-03-01_100300_.txt", "v2"),
        ])
    );
}

#[test]
fn seeding_then_rerun_is_idempotent() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "a", 100);
    write(&trees.src, "x/y/z.txt", "z", 100);
    let job = SyncJob::builder("data", trees.target()).build().unwrap();

    let (first, events) = run(&job, &run_at(0));
    assert_eq!(first.seeded_units, 1);
    assert_eq!(first.new_files, 2);
    assert!(events
        .iter()
        .any(|e| matches!(e, SyncEvent::Seeding { .. })));
    assert_eq!(tree(&trees.dst), tree(&trees.src));

    let (second, events) = run(&job, &run_at(1));
    assert_eq!(second.seeded_units, 0);
    assert_eq!(second.unchanged_files, 2);
    assert_eq!(file_operations(&events), 0);
    assert_eq!(tree(&trees.bak), BTreeMap::new());
}

#[test]
fn deletions_move_to_backup_when_tracked() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "a", 100);
    write(&trees.src, "b.txt", "b", 100);
    write(&trees.dst, "a.txt", "a", 100);
    write(&trees.dst, "c.txt", "c", 100);
    let job = SyncJob::builder("data", trees.target())
        .retention(Retention::bounded(2).unwrap())
        .sync_deleted(true)
        .build()
        .unwrap();

    let (report, events) = run(&job, &run_at(0));

    assert_eq!(report.new_files, 1);
    assert_eq!(report.deleted_files, 1);
    assert_eq!(report.unchanged_files, 1);
    assert_eq!(file_operations(&events), 2);
    assert_eq!(tree(&trees.dst), entries(&[("a.txt", "a"), ("b.txt", "b")]));
    assert_eq!(
        tree(&trees.bak),
        entries(&[("c_fsync2024-03-01_100000_.txt", "c")])
    );
}

#[test]
fn deletions_stay_without_tracking_or_backup() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "a", 100);
    write(&trees.dst, "a.txt", "a", 100);
    write(&trees.dst, "c.txt", "c", 100);

    let untracked = SyncJob::builder("data", trees.target()).build().unwrap();
    let (report, _) = run(&untracked, &run_at(0));
    assert_eq!(report.deleted_files, 0);

    let no_backup = SyncJob::builder("data", SyncTarget::new(&trees.src, &trees.dst, None))
        .sync_deleted(true)
        .build()
        .unwrap();
    let (report, events) = run(&no_backup, &run_at(1));
    assert_eq!(report.deletions_kept, 1);
    assert!(events.contains(&SyncEvent::DeletionKept {
        path: "c.txt".into()
    }));

    assert_eq!(tree(&trees.dst), entries(&[("a.txt", "a"), ("c.txt", "c")]));
}

#[test]
fn dry_run_changes_nothing_and_reports_the_same() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "a", 100);
    write(&trees.src, "b.txt", "b", 100);
    write(&trees.src, "docs/n.txt", "n2", 300);
    write(&trees.dst, "a.txt", "a", 100);
    write(&trees.dst, "c.txt", "c", 100);
    write(&trees.dst, "docs/n.txt", "n1", 100);
    let builder = || {
        SyncJob::builder("data", trees.target())
            .retention(Retention::bounded(2).unwrap())
            .sync_deleted(true)
    };
    let context = run_at(0);
    let src_before = tree(&trees.src);
    let dst_before = tree(&trees.dst);

    let (dry_report, dry_events) = run(&builder().dry_run(true).build().unwrap(), &context);

    assert_eq!(tree(&trees.src), src_before);
    assert_eq!(tree(&trees.dst), dst_before);
    assert!(!trees.bak.exists());
    assert_eq!(dry_events.first(), Some(&SyncEvent::DryRun));

    let (real_report, real_events) = run(&builder().build().unwrap(), &context);
    let without_banner: Vec<SyncEvent> = dry_events
        .into_iter()
        .filter(|e| *e != SyncEvent::DryRun)
        .collect();

    assert_eq!(without_banner, real_events);
    assert_eq!(dry_report, real_report);
    assert_eq!(
        tree(&trees.dst),
        entries(&[("a.txt", "a"), ("b.txt", "b"), ("docs/n.txt", "n2")])
    );
}

#[test]
fn per_run_versioning_keeps_run_folders() {
    let trees = Trees::new();
    write(&trees.dst, "docs/a.txt", "v0", 100);
    let job = SyncJob::builder("data", trees.target())
        .versioning(VersioningStrategy::PerRun)
        .retention(Retention::bounded(1).unwrap())
        .build()
        .unwrap();

    write(&trees.src, "docs/a.txt", "v1", 200);
    run(&job, &run_at(1));
    assert_eq!(
        tree(&trees.bak),
        entries(&[("2024-03-01_100100_alice/docs/a.txt", "v0")])
    );

    write(&trees.src, "docs/a.txt", "v2", 300);
    let (report, _) = run(&job, &run_at(2));

    assert_eq!(report.versions_pruned, 1);
    assert_eq!(
        tree(&trees.bak),
        entries(&[("2024-03-01_100200_alice/docs/a.txt", "v1")])
    );
}

#[test]
fn per_subdirectory_units_have_own_backup_roots() {
    let trees = Trees::new();
    write(&trees.src, "top.txt", "top2", 200);
    write(&trees.src, "Project0/a.txt", "a2", 200);
    write(&trees.src, "Project_old/b.txt", "b", 100);
    write(&trees.dst, "top.txt", "top1", 100);
    write(&trees.dst, "Project0/a.txt", "a1", 100);
    let job = SyncJob::builder("projects", trees.target())
        .mode(SyncMode::PerSubdirectory)
        .filter(SubdirFilter::Exclude(vec!["Project_old".into()]))
        .build()
        .unwrap();

    let (report, _) = run(&job, &run_at(0));

    assert_eq!(report.units, 2);
    assert_eq!(report.skipped_units, 1);
    assert_eq!(
        tree(&trees.dst),
        entries(&[("Project0/a.txt", "a2"), ("top.txt", "top2")])
    );
    assert_eq!(
        tree(&trees.bak),
        entries(&[
            ("Project0/a_fsync2024-03-01_100000_.txt", "a1"),
            ("top_fsync2024-03-01_100000_.txt", "top1"),
        ])
    );
}

#[test]
fn json_sink_writes_one_object_per_event() {
    let trees = Trees::new();
    write(&trees.src, "a.txt", "a", 100);
    let job = SyncJob::builder("data", trees.target()).build().unwrap();
    let sink = JsonLinesSink::new(Vec::new());

    SyncExecutor::new(&job, &sink).run(&run_at(0)).unwrap();

    let output = String::from_utf8(sink.into_inner()).unwrap();
    let kinds: Vec<String> = output
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            value["type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("unit:phase"));
    assert!(kinds.iter().any(|k| k == "job:started"));
    assert_eq!(kinds.last().map(String::as_str), Some("job:finished"));
    assert!(kinds.iter().any(|k| k == "mirror:copied"));
}
