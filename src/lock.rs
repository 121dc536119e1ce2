//! Per-run advisory lock files.
//!
//! A resume holds `<lock dir>/run-<run_id>.lock` for its whole duration. The
//! file records the owning PID; a lock whose PID is no longer alive is stale
//! and is removed on the next acquire. This protects against an operator
//! launching the same resume twice, not against a hostile concurrent writer.
//!
//! # Atomicity
//!
//! A lock file is never visible half-written. The holder's [`LockInfo`] is
//! written and synced to a uniquely named staging file first, then
//! hard-linked into place; `hard_link` fails with `AlreadyExists` if any
//! other lock is present, so exactly one of several racing acquirers wins.
//!
//! Stale locks are reclaimed by renaming them to a unique tombstone and
//! re-reading the tombstone. Only a tombstone that still names a dead
//! process is deleted; anything else is linked back and reported as held.
//!
//! On platforms without a liveness check every recorded holder counts as
//! alive, and a lock left behind by a crash must be deleted by hand.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EngineError;

/// An unparseable lock file younger than this is assumed to belong to a
/// writer that has not finished yet.
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

const ACQUIRE_ATTEMPTS: usize = 3;

/// Contents of a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub run_id: String,
    pub acquired_at: i64,
}

/// A held run lock. Released explicitly or on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: String,
    released: bool,
}

/// Deterministic lock path for a run.
pub fn lock_path(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("run-{run_id}.lock"))
}

/// What a reclaim attempt found in the tombstone.
enum Reclaim {
    /// The stale file is gone; try linking again.
    Cleared,
    /// The file turned out to belong to a live holder and was put back.
    Held(EngineError),
}

impl RunLock {
    /// Take the lock for `run_id`.
    ///
    /// Fails with [`EngineError::Locked`] if the file exists and names a live
    /// process (including this one), and with [`EngineError::LockUnreadable`]
    /// if it cannot be parsed but was modified within [`UNREADABLE_GRACE`].
    /// A file naming a dead process, or an older unparseable one, is
    /// reclaimed and the acquire retried.
    pub fn acquire(dir: &Path, run_id: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create lock directory: {}", dir.display()))?;
        let path = lock_path(dir, run_id);

        let info = LockInfo {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            acquired_at: chrono::Utc::now().timestamp(),
        };
        let staged = stage(dir, run_id, &info)?;
        let linked = link_into_place(&staged, &path, run_id);
        if let Err(e) = fs::remove_file(&staged) {
            tracing::debug!(path = %staged.display(), error = %e, "failed to remove staged lock");
        }
        linked?;

        tracing::debug!(run_id, path = %path.display(), "run lock acquired");
        Ok(Self {
            path,
            run_id: run_id.to_string(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file unconditionally.
    pub fn release(mut self) {
        self.remove();
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(run_id = %self.run_id, "run lock released"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                run_id = %self.run_id,
                error = %e,
                "failed to remove run lock"
            ),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Write `info` to a fresh, uniquely named file next to the lock.
fn stage(dir: &Path, run_id: &str, info: &LockInfo) -> Result<PathBuf> {
    let staged = dir.join(format!(".run-{run_id}.{}.tmp", uuid::Uuid::new_v4()));
    let json = serde_json::to_string(info)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staged)
        .with_context(|| format!("Failed to create staged lock: {}", staged.display()))?;
    file.write_all(json.as_bytes())?;
    file.sync_all()?;
    Ok(staged)
}

fn link_into_place(staged: &Path, path: &Path, run_id: &str) -> Result<()> {
    for _ in 0..ACQUIRE_ATTEMPTS {
        match fs::hard_link(staged, path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to create lock file: {}", path.display()))
            }
        }

        match read_lock(path) {
            Some(holder) if process_alive(holder.pid) => {
                return Err(locked(run_id, holder.pid, path).into());
            }
            Some(_) => {}
            None => match modified_age(path) {
                // Vanished between the link attempt and the read.
                None => continue,
                Some(age) if age < UNREADABLE_GRACE => {
                    return Err(EngineError::LockUnreadable {
                        run_id: run_id.to_string(),
                        path: path.to_path_buf(),
                    }
                    .into());
                }
                Some(_) => {}
            },
        }

        if let Reclaim::Held(err) = reclaim(path, run_id)? {
            return Err(err.into());
        }
    }

    anyhow::bail!(
        "could not acquire run lock {} (lost a race with another process)",
        path.display()
    )
}

/// Move a presumed-stale lock aside and delete it only if it still is.
fn reclaim(path: &Path, run_id: &str) -> Result<Reclaim> {
    let tombstone = path.with_file_name(format!(
        ".run-{run_id}.{}.stale",
        uuid::Uuid::new_v4()
    ));
    match fs::rename(path, &tombstone) {
        Ok(()) => {}
        // Another acquirer reclaimed it first.
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Reclaim::Cleared),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to move stale lock: {}", path.display()))
        }
    }

    let live_holder = match read_lock(&tombstone) {
        Some(holder) if process_alive(holder.pid) => Some(holder.pid),
        Some(holder) => {
            tracing::warn!(
                run_id,
                stale_pid = holder.pid,
                path = %path.display(),
                "removed stale run lock"
            );
            None
        }
        None => {
            tracing::warn!(run_id, path = %path.display(), "removed unreadable run lock");
            None
        }
    };

    let Some(pid) = live_holder else {
        fs::remove_file(&tombstone)
            .with_context(|| format!("Failed to remove {}", tombstone.display()))?;
        return Ok(Reclaim::Cleared);
    };

    // A live holder slipped in between our read and the rename: put it back.
    match fs::hard_link(&tombstone, path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            tracing::warn!(run_id, pid, "run lock replaced while being restored");
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to restore lock: {}", path.display()))
        }
    }
    let _ = fs::remove_file(&tombstone);
    Ok(Reclaim::Held(locked(run_id, pid, path)))
}

fn locked(run_id: &str, pid: u32, path: &Path) -> EngineError {
    EngineError::Locked {
        run_id: run_id.to_string(),
        pid,
        path: path.to_path_buf(),
    }
}

fn modified_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.elapsed().unwrap_or_default())
}

/// Read and parse a lock file. `None` if missing or malformed.
pub fn read_lock(path: &Path) -> Option<LockInfo> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 doesn't actually send a signal;
    // it only checks whether the process exists.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    tracing::warn!(
        pid,
        "cannot check process liveness on this platform; treating the lock holder as \
         alive. Delete the lock file by hand if that process has exited"
    );
    true
}
