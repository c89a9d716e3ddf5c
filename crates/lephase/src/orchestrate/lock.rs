//! Single-instance run lock
//!
//! The lock is a JSON file created with `create_new`, so at most one process can
//! hold it. Locks are never expired automatically: a lock left behind by a dead
//! process blocks runs until an operator overrides it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Holder process id
    pub pid: u32,
    /// When the lock was taken
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    /// Record for the current process.
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }
}

/// Failure acquiring or releasing the lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder owns the lock
    #[error("lock {} is held", .path.display())]
    Held {
        /// Lock file
        path: PathBuf,
        /// Recorded holder; `None` when the file is unreadable
        holder: Option<LockRecord>,
    },

    /// Filesystem failure
    #[error("lock file {}: {source}", .path.display())]
    Io {
        /// Lock file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
}

/// Tells whether a process is still running.
pub trait ProcessProbe: Send + Sync {
    /// Whether `pid` refers to a live process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probe that treats every holder as alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeAlive;

impl ProcessProbe for AssumeAlive {
    fn is_alive(&self, _pid: u32) -> bool {
        true
    }
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl RunLock {
    /// Take the lock at `path`, failing fast if anyone holds it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::read(path).ok().flatten();
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    holder,
                });
            }
            Err(err) => return Err(io(err)),
        };

        let record = LockRecord::current();
        let written = serde_json::to_vec(&record)
            .map_err(std::io::Error::from)
            .and_then(|json| file.write_all(&json))
            .and_then(|_| file.sync_all());
        if let Err(err) = written {
            let _ = fs::remove_file(path);
            return Err(io(err));
        }

        info!(lock = %path.display(), pid = record.pid, "acquired run lock");
        Ok(Self {
            path: path.to_path_buf(),
            record,
            released: false,
        })
    }

    /// Current holder of the lock at `path`, if any.
    pub fn read(path: &Path) -> Result<Option<LockRecord>, LockError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| LockError::Io {
                path: path.to_path_buf(),
                source: err.into(),
            })
    }

    /// Remove the lock at `path` if `pid` holds it. Used from signal handlers,
    /// where the guard's destructor will not run.
    pub fn release_if_held_by(path: &Path, pid: u32) -> Result<bool, LockError> {
        match Self::read(path)? {
            Some(record) if record.pid == pid => {
                Self::remove(path)?;
                info!(lock = %path.display(), pid, "released run lock");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Remove the lock at `path` regardless of its holder.
    pub fn force_remove(path: &Path) -> Result<bool, LockError> {
        let removed = Self::remove(path)?;
        if removed {
            warn!(lock = %path.display(), "removed run lock by operator override");
        }
        Ok(removed)
    }

    fn remove(path: &Path) -> Result<bool, LockError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LockError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Who holds this lock.
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now rather than on drop.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        Self::release_if_held_by(&self.path, self.record.pid).map(|_| ())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match Self::release_if_held_by(&self.path, self.record.pid) {
            Ok(true) => {}
            Ok(false) => debug!(lock = %self.path.display(), "run lock already gone"),
            Err(err) => warn!(lock = %self.path.display(), error = %err, "failed to release run lock"),
        }
    }
}
