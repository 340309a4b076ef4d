use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::persist::{write_json_atomic, PersistError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid settings path: {0:?}")]
    InvalidPath(String),
}

// ---------------------------------------------------------------------------
// Well-known keys
// ---------------------------------------------------------------------------

pub const AUTO_START: &str = "auto_start";
pub const MAX_CONCURRENT_BOTS: &str = "max_concurrent_bots";
pub const AUTO_RESTART_ON_CRASH: &str = "auto_restart_on_crash";
pub const LOG_RETENTION_DAYS: &str = "settings.log_retention_days";
pub const BACKUP_ON_EDIT: &str = "settings.backup_on_edit";
pub const NOTIFY_ON_CRASH: &str = "settings.notify_on_crash";

/// The document written on first boot.
pub fn default_settings() -> Value {
    json!({
        "auto_start": true,
        "max_concurrent_bots": 5,
        "auto_restart_on_crash": false,
        "settings": {
            "log_retention_days": 7,
            "backup_on_edit": true,
            "notify_on_crash": false
        }
    })
}

// ---------------------------------------------------------------------------
// SettingsStore
// ---------------------------------------------------------------------------

/// Runtime settings addressed by dotted paths (`settings.log_retention_days`).
///
/// `get` walks the tree and yields `None` on any missing segment. `set`
/// creates intermediate objects as needed, replacing scalars that sit in the
/// way, and rewrites the document on every call.
pub struct SettingsStore {
    path: PathBuf,
    doc: Mutex<Value>,
}

impl SettingsStore {
    /// Load settings from `path`, writing the defaults when it is missing.
    ///
    /// A corrupt document falls back to `{"auto_start": true}` in memory.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let doc = if path.exists() {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|e| e.to_string()))
                .and_then(|value| {
                    if value.is_object() {
                        Ok(value)
                    } else {
                        Err("settings root is not an object".to_string())
                    }
                });
            match parsed {
                Ok(value) => {
                    info!(path = %path.display(), "loaded runtime settings");
                    value
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "runtime settings unreadable, using minimal defaults");
                    json!({ "auto_start": true })
                }
            }
        } else {
            let value = default_settings();
            if let Err(e) = write_json_atomic(&path, &value) {
                warn!(path = %path.display(), error = %e, "failed to write default settings");
            }
            value
        };

        Self {
            path,
            doc: Mutex::new(doc),
        }
    }

    /// Like [`SettingsStore::load`], but a missing document is only
    /// defaulted in memory and nothing is written.
    pub fn read(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.exists() {
            return Self::load(path);
        }
        Self {
            path,
            doc: Mutex::new(default_settings()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Value> {
        self.doc.lock().unwrap_or_else(|e| {
            warn!("settings lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Value at `path`, or `None` when any segment is missing.
    pub fn get(&self, path: &str) -> Option<Value> {
        let segments = split_path(path).ok()?;
        lookup(&self.lock(), &segments).cloned()
    }

    /// Value at `path`, or `default` when absent.
    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).unwrap_or(default)
    }

    /// Value at `path` deserialized as `T`; `None` when absent or mistyped.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get(path)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Set `path` to `value` and persist the document.
    ///
    /// Persistence errors are logged; the in-memory value is kept.
    pub fn set(&self, path: &str, value: Value) -> Result<(), SettingsError> {
        let segments = split_path(path)?;
        let mut doc = self.lock();
        insert(&mut doc, &segments, value);
        if let Err(e) = write_json_atomic(&self.path, &*doc) {
            warn!(path = %self.path.display(), error = %e, "failed to persist runtime settings");
        }
        Ok(())
    }

    /// Write the current document now, surfacing any error.
    pub fn flush(&self) -> Result<(), PersistError> {
        write_json_atomic(&self.path, &*self.lock())
    }

    /// A copy of the whole document.
    pub fn snapshot(&self) -> Value {
        self.lock().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -- typed accessors ----------------------------------------------------

    pub fn auto_start(&self) -> bool {
        self.get_as(AUTO_START).unwrap_or(true)
    }

    /// Cap on concurrently running workers; `None` when unlimited.
    pub fn max_concurrent_bots(&self) -> Option<usize> {
        match self.get_as::<i64>(MAX_CONCURRENT_BOTS) {
            Some(n) if n > 0 => Some(n as usize),
            Some(_) => None,
            None => Some(5),
        }
    }

    pub fn auto_restart_on_crash(&self) -> bool {
        self.get_as(AUTO_RESTART_ON_CRASH).unwrap_or(false)
    }

    pub fn log_retention_days(&self) -> u64 {
        self.get_as(LOG_RETENTION_DAYS).unwrap_or(7)
    }

    pub fn backup_on_edit(&self) -> bool {
        self.get_as(BACKUP_ON_EDIT).unwrap_or(true)
    }

    pub fn notify_on_crash(&self) -> bool {
        self.get_as(NOTIFY_ON_CRASH).unwrap_or(false)
    }
}

impl std::fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsStore")
            .field("path", &self.path)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tree walking
// ---------------------------------------------------------------------------

fn split_path(path: &str) -> Result<Vec<&str>, SettingsError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(SettingsError::InvalidPath(path.to_string()));
    }
    Ok(segments)
}

fn lookup<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, key| node.as_object()?.get(*key))
}

fn insert(root: &mut Value, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut node = root;
    for key in parents {
        node = ensure_object(node)
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.to_string(), value);
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
