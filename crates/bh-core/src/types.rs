use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of entries kept in a worker's status history.
pub const MAX_STATUS_HISTORY: usize = 50;

// ---------------------------------------------------------------------------
// WorkerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Crashed,
    Error,
}

impl WorkerStatus {
    /// Terminal statuses are the ones a runner reports when its process is gone.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Stopped | WorkerStatus::Crashed | WorkerStatus::Error
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Error => "error",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a worker to be stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedBy {
    User,
    ServerShutdown,
}

// ---------------------------------------------------------------------------
// StatusDetails / StatusEntry
// ---------------------------------------------------------------------------

/// Extra fields recorded alongside a status change.
///
/// Every field that is set is written into the history entry and merged into
/// the worker record; unset fields leave the record untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_by: Option<StoppedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: WorkerStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub details: StatusDetails,
}

// ---------------------------------------------------------------------------
// StatusUpdate: builder passed to `StateStore::transition`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: WorkerStatus,
    pub details: StatusDetails,
    /// Overwrites the record's `auto_restart` flag when set. Not part of the
    /// history entry.
    pub auto_restart: Option<bool>,
}

impl StatusUpdate {
    pub fn new(status: WorkerStatus) -> Self {
        Self {
            status,
            details: StatusDetails::default(),
            auto_restart: None,
        }
    }

    pub fn pid(mut self, pid: u32) -> Self {
        self.details.pid = Some(pid);
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.details.exit_code = Some(code);
        self
    }

    pub fn stopped_by(mut self, by: StoppedBy) -> Self {
        self.details.stopped_by = Some(by);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.details.error = Some(message.into());
        self
    }

    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.details.command = Some(command.into());
        self
    }

    pub fn start_time(mut self, at: DateTime<Utc>) -> Self {
        self.details.start_time = Some(at);
        self
    }

    pub fn auto_restart(mut self, value: bool) -> Self {
        self.auto_restart = Some(value);
        self
    }
}

// ---------------------------------------------------------------------------
// WorkerRecord
// ---------------------------------------------------------------------------

/// Persisted state of one worker, keyed by its directory name.
///
/// `status` always matches the last `status_history` entry; both are only
/// changed through [`WorkerRecord::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Filled from the map key on load when absent.
    #[serde(default)]
    pub id: String,
    pub status: WorkerStatus,
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_by: Option<StoppedBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub status_history: Vec<StatusEntry>,
}

fn default_auto_restart() -> bool {
    true
}

impl WorkerRecord {
    /// Build the record for a worker seen for the first time, with `update`
    /// as its first history entry.
    pub fn create(id: impl Into<String>, update: StatusUpdate, now: DateTime<Utc>) -> Self {
        let mut record = Self {
            id: id.into(),
            status: update.status,
            auto_restart: default_auto_restart(),
            pid: None,
            exit_code: None,
            stopped_by: None,
            error: None,
            command: None,
            start_time: None,
            created_at: now,
            last_updated: now,
            status_history: Vec::new(),
        };
        record.apply(update, now);
        record
    }

    /// Append a history entry, trim history to [`MAX_STATUS_HISTORY`], and
    /// merge the update's details into the record.
    pub fn apply(&mut self, update: StatusUpdate, now: DateTime<Utc>) {
        let StatusUpdate {
            status,
            details,
            auto_restart,
        } = update;

        self.status = status;
        self.last_updated = now;
        if let Some(flag) = auto_restart {
            self.auto_restart = flag;
        }

        if let Some(pid) = details.pid {
            self.pid = Some(pid);
        }
        if let Some(code) = details.exit_code {
            self.exit_code = Some(code);
        }
        if let Some(by) = details.stopped_by {
            self.stopped_by = Some(by);
        }
        if let Some(error) = &details.error {
            self.error = Some(error.clone());
        }
        if let Some(command) = &details.command {
            self.command = Some(command.clone());
        }
        if let Some(at) = details.start_time {
            self.start_time = Some(at);
        }

        self.status_history.push(StatusEntry {
            status,
            timestamp: now,
            details,
        });
        if self.status_history.len() > MAX_STATUS_HISTORY {
            let overflow = self.status_history.len() - MAX_STATUS_HISTORY;
            self.status_history.drain(..overflow);
        }
    }

    /// Most recent history entry, if any.
    pub fn last_entry(&self) -> Option<&StatusEntry> {
        self.status_history.last()
    }
}

// ---------------------------------------------------------------------------
// StateDocument: the whole `bot_state.json`
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub bots: BTreeMap<String, WorkerRecord>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_start_time: Option<DateTime<Utc>>,
}

impl StateDocument {
    /// Empty state stamped with a fresh boot time.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            bots: BTreeMap::new(),
            last_updated: now,
            server_start_time: Some(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_records_first_history_entry() {
        let now = Utc::now();
        let record = WorkerRecord::create(
            "echo-bot",
            StatusUpdate::new(WorkerStatus::Starting).auto_restart(false),
            now,
        );
        assert_eq!(record.status, WorkerStatus::Starting);
        assert!(!record.auto_restart);
        assert_eq!(record.status_history.len(), 1);
        assert_eq!(record.last_entry().unwrap().status, record.status);
        assert_eq!(record.created_at, now);
    }

    #[test]
    fn apply_merges_details_without_clearing() {
        let now = Utc::now();
        let mut record = WorkerRecord::create(
            "w",
            StatusUpdate::new(WorkerStatus::Running)
                .pid(41)
                .command("python3 main.py"),
            now,
        );
        record.apply(StatusUpdate::new(WorkerStatus::Crashed).exit_code(2), now);

        assert_eq!(record.status, WorkerStatus::Crashed);
        assert_eq!(record.pid, Some(41));
        assert_eq!(record.exit_code, Some(2));
        assert_eq!(record.command.as_deref(), Some("python3 main.py"));
    }

    #[test]
    fn history_is_capped_fifo() {
        let now = Utc::now();
        let mut record = WorkerRecord::create("w", StatusUpdate::new(WorkerStatus::Starting), now);
        for code in 0..120 {
            record.apply(StatusUpdate::new(WorkerStatus::Crashed).exit_code(code), now);
        }
        assert_eq!(record.status_history.len(), MAX_STATUS_HISTORY);
        assert_eq!(record.status_history[0].details.exit_code, Some(70));
        assert_eq!(record.last_entry().unwrap().details.exit_code, Some(119));
    }

    #[test]
    fn history_entry_flattens_details() {
        let entry = StatusEntry {
            status: WorkerStatus::Stopped,
            timestamp: Utc::now(),
            details: StatusDetails {
                stopped_by: Some(StoppedBy::ServerShutdown),
                ..StatusDetails::default()
            },
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["stopped_by"], "server_shutdown");
        assert!(json.get("pid").is_none());
    }

    #[test]
    fn record_without_auto_restart_defaults_to_true() {
        let json = serde_json::json!({
            "id": "legacy",
            "status": "running",
            "created_at": "2026-01-01T00:00:00Z",
            "last_updated": "2026-01-01T00:00:00Z"
        });
        let record: WorkerRecord = serde_json::from_value(json).unwrap();
        assert!(record.auto_restart);
        assert!(record.status_history.is_empty());
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkerStatus::Stopped.is_terminal());
        assert!(WorkerStatus::Crashed.is_terminal());
        assert!(WorkerStatus::Error.is_terminal());
        assert!(!WorkerStatus::Starting.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert_eq!(WorkerStatus::Running.to_string(), "running");
    }
}
