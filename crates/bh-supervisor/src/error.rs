use bh_core::log_sink::LogSinkError;
use bh_core::persist::PersistError;
use bh_core::settings::SettingsError;
use bh_core::types::{StoppedBy, WorkerStatus};
use serde::Serialize;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("bot not found: {0}")]
    NotFound(String),

    #[error("bot is already running: {0}")]
    AlreadyRunning(String),

    #[error("bot is not running: {0}")]
    NotRunning(String),

    #[error("no scripts found for bot {0}")]
    NoScripts(String),

    #[error("supervisor is at capacity ({max} bots running)")]
    AtCapacity { max: usize },

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error("failed to launch {id}: {message}")]
    LaunchFailure { id: String, message: String },

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("log error: {0}")]
    LogSink(#[from] LogSinkError),

    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),
}

impl SupervisorError {
    /// Stable machine-readable code for front ends.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::NoScripts(_) => "no_entry_point",
            SupervisorError::AtCapacity { .. } => "at_capacity",
            SupervisorError::ShuttingDown => "shutting_down",
            SupervisorError::LaunchFailure { .. } => "launch_failure",
            SupervisorError::Settings(_) => "invalid_config_path",
            SupervisorError::LogSink(_) => "log_error",
            SupervisorError::Persist(_) => "persistence_failure",
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A launch was accepted. The worker is `starting`; its runner reports
/// `running` once the process is up.
#[derive(Debug, Clone, Serialize)]
pub struct Started {
    pub worker_id: String,
    pub message: String,
}

impl Started {
    pub(crate) fn new(worker_id: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            message: format!("Bot {worker_id} started"),
        }
    }
}

/// A running worker was stopped.
///
/// `status` and `stopped_by` are the run's recorded terminal entry. A worker
/// that exited on its own just as the stop arrived is reported with its own
/// status and no `stopped_by`.
#[derive(Debug, Clone, Serialize)]
pub struct Stopped {
    pub worker_id: String,
    pub exit_code: Option<i32>,
    pub status: WorkerStatus,
    pub stopped_by: Option<StoppedBy>,
    pub message: String,
}

impl Stopped {
    pub(crate) fn new(
        worker_id: &str,
        exit_code: Option<i32>,
        status: WorkerStatus,
        stopped_by: Option<StoppedBy>,
    ) -> Self {
        let message = if stopped_by == Some(StoppedBy::User) {
            format!("Bot {worker_id} stopped")
        } else {
            format!("Bot {worker_id} exited ({status}) before the stop took effect")
        };
        Self {
            worker_id: worker_id.to_string(),
            exit_code,
            status,
            stopped_by,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_for_lifecycle_errors() {
        let errors = [
            SupervisorError::NotFound("a".into()),
            SupervisorError::AlreadyRunning("a".into()),
            SupervisorError::NotRunning("a".into()),
            SupervisorError::NoScripts("a".into()),
            SupervisorError::AtCapacity { max: 1 },
        ];
        let mut codes: Vec<_> = errors.iter().map(|e| e.code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn display_names_the_worker() {
        let err = SupervisorError::AlreadyRunning("echo".into());
        assert_eq!(err.to_string(), "bot is already running: echo");
        assert_eq!(Started::new("echo").message, "Bot echo started");
    }

    #[test]
    fn stop_message_reflects_who_ended_the_run() {
        let by_user = Stopped::new("echo", Some(-15), WorkerStatus::Stopped, Some(StoppedBy::User));
        assert_eq!(by_user.message, "Bot echo stopped");

        let raced = Stopped::new("echo", Some(2), WorkerStatus::Crashed, None);
        assert_eq!(raced.message, "Bot echo exited (crashed) before the stop took effect");
    }
}
