use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host configuration loaded from `~/.bothost/config.toml`.
///
/// This is the static, operator-edited side of configuration: where data
/// lives, how workers are launched, and supervisor timings. Settings that
/// change at runtime live in [`crate::settings::SettingsStore`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl HostConfig {
    /// Load from `~/.bothost/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = HostConfig::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: HostConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that types alone cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.interpreter.trim().is_empty() {
            return Err(ConfigError::Validation(
                "runtime.interpreter must not be empty".into(),
            ));
        }
        if self.runtime.script_extension.trim().is_empty() {
            return Err(ConfigError::Validation(
                "runtime.script_extension must not be empty".into(),
            ));
        }
        if self.supervisor.stop_grace_ms == 0 {
            return Err(ConfigError::Validation(
                "supervisor.stop_grace_ms must be greater than zero".into(),
            ));
        }
        if matches!(&self.runtime.install_command, Some(cmd) if cmd.is_empty()) {
            return Err(ConfigError::Validation(
                "runtime.install_command must name a program when set".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        default_root().join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

/// Data locations. Relative entries resolve against `root`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_root_string")]
    pub root: String,
    #[serde(default = "default_bots_dir")]
    pub bots_dir: String,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    #[serde(default = "default_backups_dir")]
    pub backups_dir: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_config_file")]
    pub config_file: String,
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            root: default_root_string(),
            bots_dir: default_bots_dir(),
            logs_dir: default_logs_dir(),
            backups_dir: default_backups_dir(),
            state_file: default_state_file(),
            config_file: default_config_file(),
            lock_file: default_lock_file(),
        }
    }
}

impl PathsConfig {
    /// Paths rooted at `root`, with every other entry left at its default.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    /// The root directory with a leading `~` expanded.
    pub fn root_dir(&self) -> PathBuf {
        expand_home(&self.root)
    }

    fn resolve(&self, entry: &str) -> PathBuf {
        let path = expand_home(entry);
        if path.is_absolute() {
            path
        } else {
            self.root_dir().join(path)
        }
    }

    pub fn bots_dir(&self) -> PathBuf {
        self.resolve(&self.bots_dir)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.resolve(&self.logs_dir)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.resolve(&self.backups_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.state_file)
    }

    pub fn config_file(&self) -> PathBuf {
        self.resolve(&self.config_file)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.resolve(&self.lock_file)
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bothost")
}
fn default_root_string() -> String {
    "~/.bothost".into()
}
fn default_bots_dir() -> String {
    "bots".into()
}
fn default_logs_dir() -> String {
    "logs".into()
}
fn default_backups_dir() -> String {
    "backups".into()
}
fn default_state_file() -> String {
    "bot_state.json".into()
}
fn default_config_file() -> String {
    "bot_config.json".into()
}
fn default_lock_file() -> String {
    "bothost.lock".into()
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    match raw.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(raw),
    }
}

/// How worker programs are discovered and launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Program that runs a worker's entry script.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Arguments placed before the script name.
    #[serde(default)]
    pub interpreter_args: Vec<String>,
    /// Extension (without the dot) of eligible script files.
    #[serde(default = "default_script_extension")]
    pub script_extension: String,
    /// Preferred entry-point stems, highest priority first.
    #[serde(default = "default_entry_points")]
    pub entry_points: Vec<String>,
    /// Dependency manifest that triggers an install before launch.
    #[serde(default = "default_dependency_manifest")]
    pub dependency_manifest: String,
    /// Install command; defaults to `<interpreter> -m pip install -r <manifest>`.
    #[serde(default)]
    pub install_command: Option<Vec<String>>,
    /// Extra environment passed to workers and the installer.
    #[serde(default = "default_worker_env")]
    pub env: BTreeMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            interpreter_args: Vec::new(),
            script_extension: default_script_extension(),
            entry_points: default_entry_points(),
            dependency_manifest: default_dependency_manifest(),
            install_command: None,
            env: default_worker_env(),
        }
    }
}

impl RuntimeConfig {
    /// The install command as program + arguments.
    pub fn install_command(&self) -> Vec<String> {
        match &self.install_command {
            Some(cmd) => cmd.clone(),
            None => vec![
                self.interpreter.clone(),
                "-m".into(),
                "pip".into(),
                "install".into(),
                "-r".into(),
                self.dependency_manifest.clone(),
            ],
        }
    }
}

fn default_interpreter() -> String {
    "python3".into()
}
fn default_script_extension() -> String {
    "py".into()
}
fn default_entry_points() -> Vec<String> {
    ["main", "bot", "app", "run", "start"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_dependency_manifest() -> String {
    "requirements.txt".into()
}
fn default_worker_env() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ("PYTHONUTF8".to_string(), "1".to_string()),
        ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
    ])
}

/// Supervisor timings, all in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Wait after the graceful signal before killing a worker.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Delay before each auto-start at boot.
    #[serde(default = "default_start_stagger_ms")]
    pub start_stagger_ms: u64,
    /// Pause between stop and start on restart.
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,
    /// Pause before relaunching a crashed worker.
    #[serde(default = "default_crash_restart_delay_ms")]
    pub crash_restart_delay_ms: u64,
    /// Consecutive crash relaunches before giving up.
    #[serde(default = "default_max_crash_restarts")]
    pub max_crash_restarts: u32,
    /// Lines returned by a log tail when no count is given.
    #[serde(default = "default_log_tail")]
    pub log_tail_default: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: default_stop_grace_ms(),
            start_stagger_ms: default_start_stagger_ms(),
            restart_settle_ms: default_restart_settle_ms(),
            crash_restart_delay_ms: default_crash_restart_delay_ms(),
            max_crash_restarts: default_max_crash_restarts(),
            log_tail_default: default_log_tail(),
        }
    }
}

impl SupervisorConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }

    pub fn crash_restart_delay(&self) -> Duration {
        Duration::from_millis(self.crash_restart_delay_ms)
    }
}

fn default_stop_grace_ms() -> u64 {
    5_000
}
fn default_start_stagger_ms() -> u64 {
    500
}
fn default_restart_settle_ms() -> u64 {
    1_000
}
fn default_crash_restart_delay_ms() -> u64 {
    1_000
}
fn default_max_crash_restarts() -> u32 {
    5
}
fn default_log_tail() -> usize {
    100
}
