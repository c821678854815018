//! Filesystem reconciliation: the safety net that removes blobs, derived
//! files, temp files, and stale locks that no database row accounts for.

use crate::ReconcilerConfig;
use crate::db::Database;
use crate::storage::PhotoStorage;
use crate::thumbnails::{self, LOCK_SUFFIX, TEMP_PREFIX};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Counters for one reconciliation pass. In dry-run mode the counters report
/// what would have been deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub files_deleted: usize,
    pub dirs_deleted: usize,
    pub locks_deleted: usize,
    pub errors: usize,
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} file(s), {} dir(s), {} lock(s) deleted, {} error(s)",
            self.files_deleted, self.dirs_deleted, self.locks_deleted, self.errors
        )
    }
}

pub struct Reconciler {
    db: Arc<Database>,
    storage: PhotoStorage,
    config: ReconcilerConfig,
    lock_timeout: Duration,
    running: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(
        db: Arc<Database>,
        storage: PhotoStorage,
        config: ReconcilerConfig,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            db,
            storage,
            config,
            lock_timeout,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one reconciliation pass. Passes are single-flight: a second caller
    /// waits for the current pass to finish before starting its own.
    pub async fn run(&self, dry_run: bool) -> ReconcileReport {
        let _guard = self.running.lock().await;

        let db = self.db.clone();
        let storage = self.storage.clone();
        let min_age = Duration::from_secs(self.config.min_age_secs);
        let lock_timeout = self.lock_timeout;

        let result =
            tokio::task::spawn_blocking(move || sweep(&db, &storage, min_age, lock_timeout, dry_run))
                .await;
        match result {
            Ok(report) => {
                info!("reconciliation pass finished: {}", report);
                report
            }
            Err(e) => {
                error!("reconciliation task panicked: {}", e);
                ReconcileReport {
                    errors: 1,
                    ..Default::default()
                }
            }
        }
    }

    /// Spawn the periodic background loop. Returns `None` when the interval
    /// is unset or zero.
    pub fn start_periodic(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let minutes = match self.config.interval_minutes {
            Some(m) if m > 0 => m,
            _ => {
                info!("periodic reconciliation disabled");
                return None;
            }
        };
        info!("reconciling every {} minute(s)", minutes);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
            // The first tick fires immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run(false).await;
            }
        }))
    }
}

/// One full pass over the storage root. Every failure is counted and logged,
/// never propagated; a reconciler that aborts mid-pass leaves more mess than
/// one that skips a file.
fn sweep(
    db: &Database,
    storage: &PhotoStorage,
    min_age: Duration,
    lock_timeout: Duration,
    dry_run: bool,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let entries = match std::fs::read_dir(storage.root()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return report,
        Err(e) => {
            warn!("cannot read storage root {:?}: {}", storage.root(), e);
            report.errors += 1;
            return report;
        }
    };

    // Without the authoritative place list every directory would look like an
    // orphan. Bail out rather than guess.
    let known: HashSet<i64> = match db.place_ids() {
        Ok(ids) => ids.into_iter().collect(),
        Err(e) => {
            warn!("cannot list places, skipping reconciliation pass: {}", e);
            report.errors += 1;
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("unreadable storage entry: {}", e);
                report.errors += 1;
                continue;
            }
        };
        let path = entry.path();
        if !path.is_dir() {
            debug!("ignoring stray root entry {:?}", path);
            continue;
        }
        let place_id: i64 = match entry.file_name().to_string_lossy().parse() {
            Ok(id) => id,
            Err(_) => {
                debug!("ignoring non-place directory {:?}", path);
                continue;
            }
        };

        if known.contains(&place_id) {
            clean_place_dir(db, place_id, &path, min_age, lock_timeout, dry_run, &mut report);
        } else {
            remove_orphan_dir(&path, min_age, dry_run, &mut report);
        }
    }

    report
}

/// Remove a whole place directory whose place row no longer exists.
fn remove_orphan_dir(path: &Path, min_age: Duration, dry_run: bool, report: &mut ReconcileReport) {
    if !old_enough(path, min_age) {
        debug!("orphan directory {:?} too young, keeping for now", path);
        return;
    }

    let files_inside = WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count();

    if dry_run {
        info!(
            "would delete orphan directory {:?} ({} file(s))",
            path, files_inside
        );
        report.dirs_deleted += 1;
        report.files_deleted += files_inside;
        return;
    }

    match std::fs::remove_dir_all(path) {
        Ok(()) => {
            info!("deleted orphan directory {:?} ({} file(s))", path, files_inside);
            report.dirs_deleted += 1;
            report.files_deleted += files_inside;
        }
        Err(e) => {
            warn!("could not delete orphan directory {:?}: {}", path, e);
            report.errors += 1;
        }
    }
}

/// Remove unaccounted files inside a live place directory: stale locks, old
/// temp files, and blobs or derived files with no backing row.
fn clean_place_dir(
    db: &Database,
    place_id: i64,
    dir: &Path,
    min_age: Duration,
    lock_timeout: Duration,
    dry_run: bool,
    report: &mut ReconcileReport,
) {
    let file_names = match db.file_names_for_place(place_id) {
        Ok(names) => names,
        Err(e) => {
            warn!("cannot list photos for place {}: {}", place_id, e);
            report.errors += 1;
            return;
        }
    };
    let mut expected: HashSet<String> = HashSet::new();
    for name in &file_names {
        expected.insert(name.clone());
        expected.extend(thumbnails::derived_file_names(name));
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("cannot read place directory {:?}: {}", dir, e);
            report.errors += 1;
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();

        if name.ends_with(LOCK_SUFFIX) {
            // A lock younger than the timeout may belong to a generation in
            // flight.
            if old_enough(&path, lock_timeout) {
                delete_file(&path, dry_run, &mut report.locks_deleted, &mut report.errors);
            }
            continue;
        }
        if name.starts_with(TEMP_PREFIX) {
            if old_enough(&path, min_age) {
                delete_file(&path, dry_run, &mut report.files_deleted, &mut report.errors);
            }
            continue;
        }
        if expected.contains(&name) {
            continue;
        }
        if old_enough(&path, min_age) {
            delete_file(&path, dry_run, &mut report.files_deleted, &mut report.errors);
        } else {
            debug!("unaccounted file {:?} too young, keeping for now", path);
        }
    }
}

fn delete_file(path: &Path, dry_run: bool, counter: &mut usize, errors: &mut usize) {
    if dry_run {
        info!("would delete {:?}", path);
        *counter += 1;
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("deleted {:?}", path);
            *counter += 1;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            warn!("could not delete {:?}: {}", path, e);
            *errors += 1;
        }
    }
}

/// Age gate on the modification time. Unreadable metadata counts as young;
/// a file we cannot stat is not one we should delete.
fn old_enough(path: &Path, min_age: Duration) -> bool {
    if min_age.is_zero() {
        return true;
    }
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age >= min_age)
        .unwrap_or(false)
}
