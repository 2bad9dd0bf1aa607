//! Provisioning run lock
//!
//! Ensures only one orchestrator runs per host:
//! - Lock file published whole via hard link, holding PID, timestamp and hostname
//! - Optional liveness check: a lock whose PID no longer exists is reclaimed,
//!   one contender at a time
//! - Release only removes a lock this process owns, so it is always safe

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// An unparseable lock younger than this is treated as held
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

/// A reclaim guard older than this belongs to a crashed contender
const RECLAIM_GUARD_STALE: Duration = Duration::from_secs(30);

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID holding the lock
    pub pid: u32,
    /// Unix epoch seconds when the lock was taken
    pub acquired_at: u64,
    pub hostname: String,
}

impl LockInfo {
    fn current() -> Self {
        let hostname = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            pid: process::id(),
            acquired_at: now_secs(),
            hostname,
        }
    }

    pub fn age_secs(&self) -> u64 {
        now_secs().saturating_sub(self.acquired_at)
    }

    /// Signal 0 probes for existence without delivering anything
    pub fn process_alive(&self) -> bool {
        let Ok(raw) = i32::try_from(self.pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // Exists but belongs to someone else
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{}", already_locked_message(.path, .holder))]
    AlreadyLocked {
        path: PathBuf,
        holder: Option<LockInfo>,
    },

    #[error("lock file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn already_locked_message(path: &Path, holder: &Option<LockInfo>) -> String {
    match holder {
        Some(h) => format!(
            "another provisioning run holds {} (PID {} on {}, {}s ago); if that process is gone, remove the file and re-run",
            path.display(),
            h.pid,
            h.hostname,
            h.age_secs()
        ),
        None => format!(
            "another provisioning run holds {}; if no run is in progress, remove the file and re-run",
            path.display()
        ),
    }
}

/// The host-wide lock, identified by its file
#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
    liveness_check: bool,
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, liveness_check: bool) -> Self {
        Self {
            path: path.into(),
            liveness_check,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock or fail fast naming the lock file
    ///
    /// The holder record is written to a private file first and hard-linked
    /// into place, so the lock never exists without its contents.
    pub fn acquire(&self) -> Result<RunLockGuard, LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| self.io_err(source))?;
        }

        let info = LockInfo::current();
        let staged = self.stage(&info)?;
        let result = self.publish(&staged, &info);
        let _ = fs::remove_file(&staged);
        result
    }

    fn stage(&self, info: &LockInfo) -> Result<PathBuf, LockError> {
        let staged = self.sibling(&format!("{}.tmp", Uuid::new_v4().simple()));
        let written = serde_json::to_vec_pretty(info)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            .and_then(|body| {
                let mut file = File::create(&staged)?;
                file.write_all(&body)?;
                file.sync_all()
            });
        if let Err(source) = written {
            let _ = fs::remove_file(&staged);
            return Err(self.io_err(source));
        }
        Ok(staged)
    }

    fn publish(&self, staged: &Path, info: &LockInfo) -> Result<RunLockGuard, LockError> {
        // Later passes only happen after the lock vanished or was reclaimed
        for _ in 0..3 {
            match fs::hard_link(staged, &self.path) {
                Ok(()) => {
                    info!(pid = info.pid, path = %self.path.display(), "run lock acquired");
                    return Ok(RunLockGuard {
                        lock: self.clone(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let Some(seen) = self.read_raw() else {
                        continue;
                    };
                    let holder = serde_json::from_str::<LockInfo>(&seen).ok();
                    if !self.can_reclaim(holder.as_ref()) {
                        return Err(LockError::AlreadyLocked {
                            path: self.path.clone(),
                            holder,
                        });
                    }
                    self.reclaim(&seen, holder.as_ref())?;
                }
                Err(source) => return Err(self.io_err(source)),
            }
        }

        Err(LockError::AlreadyLocked {
            path: self.path.clone(),
            holder: self.holder(),
        })
    }

    fn can_reclaim(&self, holder: Option<&LockInfo>) -> bool {
        if !self.liveness_check {
            return false;
        }
        match holder {
            Some(h) => !h.process_alive(),
            // Never written by acquire; only trusted as abandoned once it has aged
            None => older_than(&self.path, UNREADABLE_GRACE),
        }
    }

    /// Remove the exact record judged dead, at most one contender at a time
    ///
    /// Without the guard, two contenders could both remove the stale file
    /// and the slower one would delete the faster one's fresh lock.
    fn reclaim(&self, seen: &str, holder: Option<&LockInfo>) -> Result<(), LockError> {
        let guard_path = self.sibling("reclaim");
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard_path)
        {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                // A contender that crashed mid-reclaim leaves the guard behind
                if older_than(&guard_path, RECLAIM_GUARD_STALE) {
                    warn!(path = %guard_path.display(), "removing abandoned reclaim guard");
                    let _ = fs::remove_file(&guard_path);
                }
                return Err(LockError::AlreadyLocked {
                    path: self.path.clone(),
                    holder: holder.cloned(),
                });
            }
            Err(source) => return Err(self.io_err(source)),
        }

        let removed = if self.read_raw().as_deref() == Some(seen) {
            match holder {
                Some(h) => warn!(pid = h.pid, age_secs = h.age_secs(), "reclaiming lock from dead process"),
                None => warn!(path = %self.path.display(), "reclaiming unreadable lock file"),
            }
            match fs::remove_file(&self.path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(self.io_err(source)),
            }
        } else {
            Ok(())
        };
        let _ = fs::remove_file(&guard_path);
        removed
    }

    fn read_raw(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    /// `<lock file name>.<suffix>` in the lock's directory
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }

    /// Current holder, if the lock file exists and parses
    pub fn holder(&self) -> Option<LockInfo> {
        serde_json::from_str(&self.read_raw()?).ok()
    }

    pub fn is_held(&self) -> bool {
        self.path.exists()
    }

    /// Remove the lock if this process owns it
    ///
    /// Safe to call whether or not the lock was ever acquired. Returns true
    /// when a file was removed.
    pub fn release(&self) -> bool {
        match self.holder() {
            Some(info) if info.pid == process::id() => match fs::remove_file(&self.path) {
                Ok(()) => {
                    info!(path = %self.path.display(), "run lock released");
                    true
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(error = %e, "failed to release run lock");
                    }
                    false
                }
            },
            _ => false,
        }
    }

    fn io_err(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Held lock; released on `release()` or drop
#[derive(Debug)]
pub struct RunLockGuard {
    lock: RunLock,
    released: bool,
}

impl RunLockGuard {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.lock.release();
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
