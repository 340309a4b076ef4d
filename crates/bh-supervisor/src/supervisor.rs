use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bh_core::config::HostConfig;
use bh_core::log_sink::LogSink;
use bh_core::persist::write_json_atomic;
use bh_core::settings::SettingsStore;
use bh_core::state_store::StateStore;
use bh_core::types::{StateDocument, StatusUpdate, StoppedBy, WorkerRecord, WorkerStatus};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry_point::{list_scripts, EntryPointError};
use crate::error::{Result, Started, Stopped, SupervisorError};
use crate::registry::{is_current, Registry, RunningHandle, RunningInfo};
use crate::runner;

/// Slack on top of the stop grace period for the runner to kill and reap.
const STOP_KILL_MARGIN: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of [`Supervisor::auto_start_all`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoStartReport {
    pub started: Vec<String>,
    /// `(worker id, reason)` for every candidate that was not started.
    pub skipped: Vec<(String, String)>,
}

/// Whole-system snapshot for status pages.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub server_start_time: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    pub running_count: usize,
    pub total_bots: usize,
    pub config: Value,
    pub bots: BTreeMap<String, WorkerRecord>,
}

#[derive(Serialize)]
struct Backup<'a> {
    timestamp: String,
    state: &'a StateDocument,
    config: &'a Value,
    running_bots: &'a [String],
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Launches, tracks and stops worker processes.
///
/// Cheap to clone; clones share one registry and one set of stores. At most
/// one run per worker id is registered at any time.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: HostConfig,
    state: StateStore,
    settings: SettingsStore,
    logs: LogSink,
    registry: Registry,
    crash_counts: Mutex<HashMap<String, u32>>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    /// Open the state and settings documents named by `config.paths`.
    pub fn open(config: HostConfig) -> Self {
        let bots_dir = config.paths.bots_dir();
        if let Err(e) = std::fs::create_dir_all(&bots_dir) {
            warn!(path = %bots_dir.display(), error = %e, "failed to create bots directory");
        }
        let state = StateStore::load(config.paths.state_file());
        let settings = SettingsStore::load(config.paths.config_file());
        let logs = LogSink::new(config.paths.logs_dir());
        Self::with_stores(config, state, settings, logs)
    }

    pub fn with_stores(
        config: HostConfig,
        state: StateStore,
        settings: SettingsStore,
        logs: LogSink,
    ) -> Self {
        info!(
            bots_dir = %config.paths.bots_dir().display(),
            state = %state.path().display(),
            "supervisor ready"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state,
                settings,
                logs,
                registry: Registry::default(),
                crash_counts: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.inner.config
    }

    pub fn state(&self) -> &StateStore {
        &self.inner.state
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn logs(&self) -> &LogSink {
        &self.inner.logs
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Launch `id` without waiting for it to come up.
    ///
    /// The worker is `starting` when this returns; its runner moves it to
    /// `running` once the process is spawned. Must be called from within a
    /// Tokio runtime.
    pub fn start(&self, id: &str, auto_restart: bool) -> Result<Started> {
        self.reset_crash_count(id);
        self.launch(id, auto_restart)
    }

    fn launch(&self, id: &str, auto_restart: bool) -> Result<Started> {
        let dir = self.preflight(id)?;
        let mut handles = self.inner.registry.lock();
        self.launch_locked(&mut handles, id, dir, auto_restart)
    }

    /// Checks that need no lock: shutdown, a valid directory, some scripts.
    fn preflight(&self, id: &str) -> Result<PathBuf> {
        if self.is_shutting_down() {
            return Err(SupervisorError::ShuttingDown);
        }
        let dir = self.worker_dir(id)?;
        match list_scripts(&dir, &self.inner.config.runtime.script_extension) {
            Ok(scripts) if scripts.is_empty() => Err(SupervisorError::NoScripts(id.to_string())),
            Ok(_) => Ok(dir),
            Err(EntryPointError::MissingDirectory(_)) => {
                Err(SupervisorError::NotFound(id.to_string()))
            }
            Err(e) => Err(SupervisorError::LaunchFailure {
                id: id.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Register a placeholder handle, record `starting` and spawn the runner.
    fn launch_locked(
        &self,
        handles: &mut HashMap<String, RunningHandle>,
        id: &str,
        dir: PathBuf,
        auto_restart: bool,
    ) -> Result<Started> {
        if handles.contains_key(id) {
            return Err(SupervisorError::AlreadyRunning(id.to_string()));
        }
        if let Some(max) = self.inner.settings.max_concurrent_bots() {
            if handles.len() >= max {
                return Err(SupervisorError::AtCapacity { max });
            }
        }

        let (handle, control) = RunningHandle::new(self.inner.logs.log_path(id));
        handles.insert(id.to_string(), handle);
        self.inner.state.transition(
            id,
            StatusUpdate::new(WorkerStatus::Starting).auto_restart(auto_restart),
        );
        tokio::spawn(runner::run(self.clone(), id.to_string(), dir, control));

        info!(worker_id = %id, auto_restart, "bot starting");
        Ok(Started::new(id))
    }

    /// Stop a running worker: SIGTERM, then a kill once the grace period
    /// elapses. Returns when the run has been recorded as `stopped`.
    pub async fn stop(&self, id: &str) -> Result<Stopped> {
        let (run_id, mut exited) = {
            let handles = self.inner.registry.lock();
            let handle = handles
                .get(id)
                .ok_or_else(|| SupervisorError::NotRunning(id.to_string()))?;
            (handle.run_id, handle.request_stop())
        };
        info!(worker_id = %id, "stop requested");

        let limit = self.inner.config.supervisor.stop_grace() + STOP_KILL_MARGIN;
        let finished = tokio::time::timeout(limit, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if !finished {
            warn!(worker_id = %id, "runner did not finish in time, deregistering");
            self.force_deregister(id, run_id);
        }

        let last = self.inner.state.get(id).and_then(|r| r.last_entry().cloned());
        let (status, exit_code, stopped_by) = match last {
            Some(entry) => (entry.status, entry.details.exit_code, entry.details.stopped_by),
            None => (WorkerStatus::Stopped, None, None),
        };
        if stopped_by == Some(StoppedBy::User) {
            info!(worker_id = %id, ?exit_code, "bot stopped");
        } else {
            info!(worker_id = %id, ?exit_code, %status, "bot exited before the stop took effect");
        }
        Ok(Stopped::new(id, exit_code, status, stopped_by))
    }

    /// Stop `id` if it is running, wait the settle delay, then start it with
    /// its persisted `auto_restart` flag.
    pub async fn restart(&self, id: &str) -> Result<Started> {
        if self.is_running(id) {
            match self.stop(id).await {
                Ok(_) | Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(self.inner.config.supervisor.restart_settle()).await;
        }
        let auto_restart = self
            .inner
            .state
            .get(id)
            .map(|r| r.auto_restart)
            .unwrap_or(true);
        self.start(id, auto_restart)
    }

    /// Stop every running worker, then start again those with
    /// `auto_restart` set, or all of them when `force` is true.
    ///
    /// Returns the number of workers started.
    pub async fn restart_all(&self, force: bool) -> usize {
        let ids = self.running_ids();
        for id in &ids {
            if let Err(e) = self.stop(id).await {
                debug!(worker_id = %id, error = %e, "stop during restart-all");
            }
        }
        if !ids.is_empty() {
            tokio::time::sleep(self.inner.config.supervisor.restart_settle()).await;
        }

        let mut restarted = 0;
        for id in &ids {
            let auto_restart = self
                .inner
                .state
                .get(id)
                .map(|r| r.auto_restart)
                .unwrap_or(true);
            if !(force || auto_restart) {
                continue;
            }
            match self.start(id, auto_restart) {
                Ok(_) => restarted += 1,
                Err(e) => warn!(worker_id = %id, error = %e, "restart-all failed to start bot"),
            }
        }
        info!(restarted, total = ids.len(), force, "restart-all finished");
        restarted
    }

    /// Flip the persisted `auto_restart` flag. Returns the new value.
    pub fn toggle_auto_restart(&self, id: &str) -> Result<bool> {
        let record = self
            .inner
            .state
            .toggle_auto_restart(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        info!(worker_id = %id, auto_restart = record.auto_restart, "auto-restart toggled");
        Ok(record.auto_restart)
    }

    /// Relaunch the workers that were running with `auto_restart` set when
    /// the previous supervisor last saw them, one stagger delay apart.
    pub async fn auto_start_all(&self) -> AutoStartReport {
        let candidates = self.inner.state.auto_start_candidates();
        info!(candidates = candidates.len(), "auto-starting bots");

        let stagger = self.inner.config.supervisor.start_stagger();
        let mut report = AutoStartReport::default();
        for id in candidates {
            tokio::time::sleep(stagger).await;
            match self.start(&id, true) {
                Ok(_) => report.started.push(id),
                Err(e @ SupervisorError::NoScripts(_)) => {
                    warn!(worker_id = %id, error = %e, "auto-start failed, no scripts");
                    self.inner
                        .state
                        .transition(&id, StatusUpdate::new(WorkerStatus::Error).error(e.to_string()));
                    report.skipped.push((id, e.to_string()));
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "auto-start skipped");
                    report.skipped.push((id, e.to_string()));
                }
            }
        }
        info!(
            started = report.started.len(),
            skipped = report.skipped.len(),
            "auto-start finished"
        );
        report
    }

    /// Record every registered worker as stopped by server shutdown.
    ///
    /// Child processes are not signalled. After this call no further
    /// transitions are recorded and new starts are refused.
    pub fn shutdown_all(&self) -> usize {
        let handles = self.inner.registry.lock();
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        let mut ids: Vec<&String> = handles.keys().collect();
        ids.sort();
        for id in &ids {
            self.inner.state.transition(
                id,
                StatusUpdate::new(WorkerStatus::Stopped).stopped_by(StoppedBy::ServerShutdown),
            );
        }
        info!(count = ids.len(), "recorded running bots as stopped by shutdown");
        ids.len()
    }

    /// Forget a worker: delete its log and its state record. Refused while
    /// the worker is running.
    pub fn remove_worker(&self, id: &str) -> Result<()> {
        let handles = self.inner.registry.lock();
        if handles.contains_key(id) {
            return Err(SupervisorError::AlreadyRunning(id.to_string()));
        }
        let had_log = self.inner.logs.remove(id)?;
        let had_record = self.inner.state.remove(id).is_some();
        drop(handles);

        self.reset_crash_count(id);
        if !(had_log || had_record) {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        info!(worker_id = %id, "bot removed");
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    pub fn status(&self, id: &str) -> Result<WorkerRecord> {
        self.inner
            .state
            .get(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub fn all_statuses(&self) -> BTreeMap<String, WorkerRecord> {
        self.inner.state.get_all()
    }

    /// Last `max_lines` lines of the worker's current log, or the configured
    /// default count when `None`.
    pub fn tail_log(&self, id: &str, max_lines: Option<usize>) -> Result<Vec<String>> {
        let max = max_lines.unwrap_or(self.inner.config.supervisor.log_tail_default);
        Ok(self.inner.logs.tail(id, max)?)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner.registry.contains(id)
    }

    /// Ids in the running registry, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        self.inner.registry.ids()
    }

    pub fn running_info(&self, id: &str) -> Option<RunningInfo> {
        self.inner.registry.info(id)
    }

    pub fn list_auto_start_candidates(&self) -> Vec<String> {
        self.inner.state.auto_start_candidates()
    }

    pub fn system_state(&self) -> SystemState {
        let bots = self.inner.state.get_all();
        SystemState {
            server_start_time: self.inner.state.server_start_time(),
            last_updated: self.inner.state.last_updated(),
            running_count: self.inner.registry.len(),
            total_bots: bots.len(),
            config: self.inner.settings.snapshot(),
            bots,
        }
    }

    // -- settings -----------------------------------------------------------

    pub fn get_config(&self, path: &str) -> Option<Value> {
        self.inner.settings.get(path)
    }

    pub fn get_config_or(&self, path: &str, default: Value) -> Value {
        self.inner.settings.get_or(path, default)
    }

    pub fn set_config(&self, path: &str, value: Value) -> Result<()> {
        self.inner.settings.set(path, value)?;
        info!(path, "runtime setting updated");
        Ok(())
    }

    // -- maintenance --------------------------------------------------------

    /// Write both documents now, surfacing any error.
    pub fn flush(&self) -> Result<()> {
        self.inner.state.flush()?;
        self.inner.settings.flush()?;
        Ok(())
    }

    /// Write `backup_<YYYYmmdd_HHMMSS>.json` into the backups directory and
    /// return its path.
    pub fn create_backup(&self) -> Result<PathBuf> {
        let now = Local::now();
        let path = self
            .inner
            .config
            .paths
            .backups_dir()
            .join(format!("backup_{}.json", now.format("%Y%m%d_%H%M%S")));

        let state = self.inner.state.snapshot();
        let config = self.inner.settings.snapshot();
        let running = self.running_ids();
        let backup = Backup {
            timestamp: now.to_rfc3339(),
            state: &state,
            config: &config,
            running_bots: &running,
        };
        write_json_atomic(&path, &backup)?;
        info!(path = %path.display(), "backup written");
        Ok(path)
    }

    /// Delete logs older than `settings.log_retention_days` that belong to
    /// no running worker.
    pub fn prune_logs(&self) -> Result<usize> {
        let days = i64::try_from(self.inner.settings.log_retention_days()).unwrap_or(i64::MAX);
        let max_age = chrono::Duration::try_days(days).unwrap_or(chrono::Duration::MAX);
        let keep: HashSet<String> = self.running_ids().into_iter().collect();
        Ok(self.inner.logs.prune_older_than(max_age, &keep)?)
    }

    // -- runner callbacks ---------------------------------------------------

    /// Record the spawned process for run `run_id`. Returns `false` when the
    /// run is no longer registered.
    pub(crate) fn mark_running(
        &self,
        id: &str,
        run_id: Uuid,
        pid: Option<u32>,
        command: &str,
        start_time: DateTime<Utc>,
    ) -> bool {
        let mut handles = self.inner.registry.lock();
        let Some(handle) = handles.get_mut(id).filter(|h| h.run_id == run_id) else {
            return false;
        };
        handle.pid = pid;

        if !self.is_shutting_down() {
            let mut update = StatusUpdate::new(WorkerStatus::Running)
                .command(command)
                .start_time(start_time);
            if let Some(pid) = pid {
                update = update.pid(pid);
            }
            self.inner.state.transition(id, update);
        }
        info!(worker_id = %id, ?pid, "bot running");
        true
    }

    /// Record run `run_id`'s terminal status and deregister it.
    ///
    /// Returns the recorded status, or `None` when the run had already been
    /// deregistered or the supervisor is shutting down.
    pub(crate) fn finish_run(
        &self,
        id: &str,
        run_id: Uuid,
        update: StatusUpdate,
    ) -> Option<WorkerStatus> {
        let mut handles = self.inner.registry.lock();
        if !is_current(&handles, id, run_id) {
            debug!(worker_id = %id, "run already deregistered");
            return None;
        }
        handles.remove(id);

        if self.is_shutting_down() {
            debug!(worker_id = %id, status = %update.status, "shutting down, terminal status not recorded");
            return None;
        }
        let status = update.status;
        self.inner.state.transition(id, update);
        Some(status)
    }

    /// Deregister a run whose runner did not answer a stop in time.
    fn force_deregister(&self, id: &str, run_id: Uuid) {
        let mut handles = self.inner.registry.lock();
        if !is_current(&handles, id, run_id) {
            return;
        }
        handles.remove(id);
        if !self.is_shutting_down() {
            self.inner.state.transition(
                id,
                StatusUpdate::new(WorkerStatus::Stopped).stopped_by(StoppedBy::User),
            );
        }
    }

    /// Relaunch a crashed worker after the crash delay, when enabled and
    /// under the consecutive-crash limit.
    pub(crate) fn schedule_crash_restart(&self, id: &str) {
        if self.is_shutting_down() || !self.inner.settings.auto_restart_on_crash() {
            return;
        }
        if !self.inner.state.get(id).is_some_and(|r| r.auto_restart) {
            return;
        }

        let max = self.inner.config.supervisor.max_crash_restarts;
        let attempt = {
            let mut counts = self.crash_counts();
            let count = counts.entry(id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if attempt > max {
            warn!(worker_id = %id, max, "crash restart limit reached, leaving bot crashed");
            return;
        }

        let delay = self.inner.config.supervisor.crash_restart_delay();
        info!(worker_id = %id, attempt, max, "scheduling crash restart");
        let sup = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sup.run_crash_restart(&id);
        });
    }

    /// The delayed half of a crash restart. The worker must still be
    /// recorded as `crashed` with `auto_restart` set, checked under the
    /// registry lock so a concurrent start, toggle or removal wins.
    fn run_crash_restart(&self, id: &str) {
        let dir = match self.preflight(id) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(worker_id = %id, error = %e, "crash restart failed");
                return;
            }
        };

        let mut handles = self.inner.registry.lock();
        let wanted = self.inner.settings.auto_restart_on_crash()
            && self
                .inner
                .state
                .get(id)
                .is_some_and(|r| r.auto_restart && r.status == WorkerStatus::Crashed);
        if !wanted {
            info!(worker_id = %id, "crash restart cancelled");
            return;
        }
        if let Err(e) = self.launch_locked(&mut handles, id, dir, true) {
            warn!(worker_id = %id, error = %e, "crash restart failed");
        }
    }

    pub(crate) fn reset_crash_count(&self, id: &str) {
        self.crash_counts().remove(id);
    }

    fn crash_counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.inner.crash_counts.lock().unwrap_or_else(|e| {
            warn!("crash count lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// The worker's source directory; ids must be plain directory names.
    fn worker_dir(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id != "."
            && id != ".."
            && !id.contains(['/', '\\']);
        if !valid {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        let dir = self.inner.config.paths.bots_dir().join(id);
        if !dir.is_dir() {
            return Err(SupervisorError::NotFound(id.to_string()));
        }
        Ok(dir)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.inner.state.path())
            .field("running", &self.inner.registry.len())
            .finish()
    }
}
