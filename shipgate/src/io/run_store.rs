//! Persisted background run records with optimistic concurrency.
//!
//! A record file holds `{revision, record}`. Writers read the revision, compute
//! the next record through the state machine, and commit with
//! [`compare_and_set`], which refuses the write if someone else committed in
//! between. Each commit holds an exclusive `<record>.lock` file for the whole
//! read, compare and write.

use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::run::BackgroundRun;
use crate::io::config::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredRun {
    /// Incremented on every committed write. Starts at 1.
    pub revision: u64,
    pub record: BackgroundRun,
}

/// Another writer committed first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run record {path} is at revision {actual}, expected {expected}")]
pub struct RevisionConflict {
    pub path: String,
    pub expected: u64,
    pub actual: u64,
}

const LOCK_POLL: Duration = Duration::from_millis(2);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the record file for `run_id` under `dir`.
pub fn run_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}

/// Load a stored run from disk.
pub fn load_run(path: &Path) -> Result<StoredRun> {
    debug!(path = %path.display(), "loading run record");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run record {}", path.display()))?;
    let stored: StoredRun = serde_json::from_str(&contents)
        .with_context(|| format!("parse run record {}", path.display()))?;
    debug!(run_id = %stored.record.id, revision = stored.revision, status = %stored.record.status, "run record loaded");
    Ok(stored)
}

/// Create a new record at revision 1. Fails if the file already exists.
pub fn create_run(path: &Path, record: &BackgroundRun) -> Result<StoredRun> {
    let _lock = RecordLock::acquire(path)?;
    if path.exists() {
        bail!("run record {} already exists", path.display());
    }
    let stored = StoredRun {
        revision: 1,
        record: record.clone(),
    };
    write_stored(path, &stored)?;
    Ok(stored)
}

/// Commit `next` if the stored revision still equals `expected_revision`.
///
/// Returns the committed record. A [`RevisionConflict`] is returned inside the
/// error chain when the revision moved; callers may `downcast_ref` it.
pub fn compare_and_set(
    path: &Path,
    expected_revision: u64,
    next: &BackgroundRun,
) -> Result<StoredRun> {
    let _lock = RecordLock::acquire(path)?;
    let current = load_run(path)?;
    if current.revision != expected_revision {
        warn!(
            path = %path.display(),
            expected = expected_revision,
            actual = current.revision,
            "run record revision conflict"
        );
        return Err(RevisionConflict {
            path: path.display().to_string(),
            expected: expected_revision,
            actual: current.revision,
        }
        .into());
    }
    if current.record.id != next.id {
        bail!(
            "run record {} holds run '{}', refusing to overwrite with '{}'",
            path.display(),
            current.record.id,
            next.id
        );
    }
    let stored = StoredRun {
        revision: current.revision + 1,
        record: next.clone(),
    };
    write_stored(path, &stored)?;
    Ok(stored)
}

/// Exclusive lock on a record, held as `<record>.lock` and removed on drop.
struct RecordLock {
    path: PathBuf,
}

impl RecordLock {
    fn acquire(record: &Path) -> Result<Self> {
        let mut name = record
            .file_name()
            .with_context(|| format!("path missing file name {}", record.display()))?
            .to_os_string();
        name.push(".lock");
        let path = record.with_file_name(name);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        bail!(
                            "run record {} is locked by {}; remove it if no writer is running",
                            record.display(),
                            path.display()
                        );
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }
}

impl Drop for RecordLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove run record lock");
        }
    }
}

fn write_stored(path: &Path, stored: &StoredRun) -> Result<()> {
    debug!(path = %path.display(), revision = stored.revision, status = %stored.record.status, "writing run record");
    let mut buf = serde_json::to_string_pretty(stored).context("serialize run record")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
