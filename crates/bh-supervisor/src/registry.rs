use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunningHandle
// ---------------------------------------------------------------------------

/// A worker this supervisor instance believes to be executing.
///
/// Installed by `start()` before its runner is spawned, so `pid` is `None`
/// until the process is up. `run_id` tells one run's handle from the next.
pub(crate) struct RunningHandle {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub pid: Option<u32>,
    stop_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
}

/// The runner's side of a handle: where stop requests arrive and where the
/// runner announces that it is done.
pub(crate) struct RunControl {
    pub run_id: Uuid,
    pub stop_rx: watch::Receiver<bool>,
    pub exited_tx: watch::Sender<bool>,
}

impl RunningHandle {
    pub fn new(log_path: PathBuf) -> (Self, RunControl) {
        let run_id = Uuid::new_v4();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);
        let handle = Self {
            run_id,
            started_at: Utc::now(),
            log_path,
            pid: None,
            stop_tx,
            exited_rx,
        };
        let control = RunControl {
            run_id,
            stop_rx,
            exited_tx,
        };
        (handle, control)
    }

    /// Ask the runner to stop; returns a receiver that flips to `true` once
    /// the runner has finished.
    pub fn request_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.send_replace(true);
        self.exited_rx.clone()
    }

    pub fn info(&self) -> RunningInfo {
        RunningInfo {
            started_at: self.started_at,
            log_path: self.log_path.clone(),
            pid: self.pid,
        }
    }
}

/// Public view of a [`RunningHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningInfo {
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub pid: Option<u32>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Mutex-guarded map of running workers.
///
/// Lock order is registry, then state store: callers that record a
/// transition tied to a registry change do so while holding this lock.
#[derive(Default)]
pub(crate) struct Registry {
    handles: Mutex<HashMap<String, RunningHandle>>,
}

impl Registry {
    pub fn lock(&self) -> MutexGuard<'_, HashMap<String, RunningHandle>> {
        self.handles.lock().unwrap_or_else(|e| {
            warn!("running registry lock was poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn info(&self, id: &str) -> Option<RunningInfo> {
        self.lock().get(id).map(RunningHandle::info)
    }
}

/// Whether `handles` holds run `run_id` of worker `id`.
pub(crate) fn is_current(
    handles: &HashMap<String, RunningHandle>,
    id: &str,
    run_id: Uuid,
) -> bool {
    handles.get(id).is_some_and(|h| h.run_id == run_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_reaches_runner() {
        let (handle, control) = RunningHandle::new(PathBuf::from("w.log"));
        assert!(!*control.stop_rx.borrow());

        let exited = handle.request_stop();
        assert!(*control.stop_rx.borrow());
        assert!(!*exited.borrow());

        control.exited_tx.send_replace(true);
        assert!(*exited.borrow());
    }

    #[test]
    fn run_ids_tell_runs_apart() {
        let registry = Registry::default();
        let (first, _c1) = RunningHandle::new(PathBuf::from("w.log"));
        let first_id = first.run_id;
        registry.lock().insert("w".into(), first);

        let (second, _c2) = RunningHandle::new(PathBuf::from("w.log"));
        assert_ne!(first_id, second.run_id);

        let handles = registry.lock();
        assert!(is_current(&handles, "w", first_id));
        assert!(!is_current(&handles, "w", second.run_id));
        assert!(!is_current(&handles, "other", first_id));
    }

    #[test]
    fn info_reflects_pid_updates() {
        let registry = Registry::default();
        let (handle, _control) = RunningHandle::new(PathBuf::from("/logs/w.log"));
        registry.lock().insert("w".into(), handle);
        assert_eq!(registry.info("w").unwrap().pid, None);

        registry.lock().get_mut("w").unwrap().pid = Some(42);
        let info = registry.info("w").unwrap();
        assert_eq!(info.pid, Some(42));
        assert_eq!(info.log_path, PathBuf::from("/logs/w.log"));
        assert_eq!(registry.ids(), vec!["w".to_string()]);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("w"));
    }
}
