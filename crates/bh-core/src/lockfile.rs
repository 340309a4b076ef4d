//! Supervisor lockfile.
//!
//! A supervisor owns its data directory exclusively: two supervisors
//! rewriting the same state document would lose each other's transitions.
//! At boot the daemon writes a JSON lockfile next to the state document.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile.
//! If two supervisors race, exactly one wins the create; the loser gets
//! `AlreadyExists` and checks whether the winner is still alive.
//!
//! ## Stale lockfile recovery
//!
//! A lockfile whose PID is no longer alive (crash, SIGKILL) is removed and
//! acquisition is retried once.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of the lockfile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorLock {
    pub pid: u32,
    pub started_at: String,
    pub state_file: String,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile and own it.
    Acquired,
    /// Another live supervisor holds the lockfile.
    AlreadyRunning(SupervisorLock),
    /// Stale lockfile was cleaned up; retry.
    StaleRemoved,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("supervisor already running (pid={pid}, state={state_file})")]
    AlreadyRunning { pid: u32, state_file: String },
    #[error("failed to acquire lockfile after stale cleanup")]
    StaleRetryExhausted,
    #[error("lockfile I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorLock {
    /// Lock describing the current process.
    pub fn for_current_process(state_file: &Path) -> Self {
        Self {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            state_file: state_file.display().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Try to exclusively create and write the lockfile at `path`.
    pub fn acquire(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL
            .open(path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match Self::read(path) {
                Some(existing) if existing.is_alive() => Ok(AcquireResult::AlreadyRunning(existing)),
                _ => {
                    tracing::info!(path = %path.display(), "removing stale supervisor lockfile");
                    Self::remove(path);
                    Ok(AcquireResult::StaleRemoved)
                }
            },
            Err(e) => Err(e),
        }
    }

    /// Acquire with one retry after stale cleanup.
    pub fn acquire_or_fail(&self, path: &Path) -> Result<(), LockError> {
        for attempt in 0..2 {
            match self.acquire(path)? {
                AcquireResult::Acquired => return Ok(()),
                AcquireResult::AlreadyRunning(existing) => {
                    return Err(LockError::AlreadyRunning {
                        pid: existing.pid,
                        state_file: existing.state_file,
                    });
                }
                AcquireResult::StaleRemoved if attempt == 0 => {
                    tracing::info!("stale lockfile removed, retrying acquire");
                    continue;
                }
                AcquireResult::StaleRemoved => break,
            }
        }
        Err(LockError::StaleRetryExhausted)
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Read the lockfile and return it only if its holder is alive.
    pub fn read_live(path: &Path) -> Option<Self> {
        Self::read(path).filter(|lock| lock.is_alive())
    }

    pub fn remove(path: &Path) {
        let _ = std::fs::remove_file(path);
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }
}

/// Path-owning guard that removes the lockfile on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the lock at `path` for this process.
    pub fn acquire(path: impl Into<PathBuf>, state_file: &Path) -> Result<Self, LockError> {
        let path = path.into();
        SupervisorLock::for_current_process(state_file).acquire_or_fail(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        SupervisorLock::remove(&self.path);
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Without a cheap probe, assume alive so a live lock is never stolen.
    true
}
