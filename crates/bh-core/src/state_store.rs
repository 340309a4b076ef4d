use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::persist::{write_json_atomic, PersistError};
use crate::types::{StateDocument, StatusUpdate, WorkerRecord, WorkerStatus};

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Durable worker state backed by a single JSON document.
///
/// Every mutation rewrites the whole document atomically before returning.
/// Write failures are logged and swallowed: the in-memory document stays
/// authoritative and the next mutation retries the write.
pub struct StateStore {
    path: PathBuf,
    state: Mutex<StateDocument>,
}

impl StateStore {
    /// Load the state document at `path`.
    ///
    /// A missing document is initialised with a fresh boot timestamp and
    /// written immediately. Records missing optional fields are accepted and
    /// a single unreadable record is dropped without its siblings. A document
    /// that is not JSON at all is replaced by an empty in-memory state so the
    /// supervisor can still boot.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let now = Utc::now();

        let state = if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|text| parse_document(&text).map_err(|e| e.to_string()))
            {
                Ok(doc) => {
                    info!(path = %path.display(), workers = doc.bots.len(), "loaded worker state");
                    doc
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "worker state unreadable, starting empty");
                    StateDocument::fresh(now)
                }
            }
        } else {
            let doc = StateDocument::fresh(now);
            if let Err(e) = write_json_atomic(&path, &doc) {
                warn!(path = %path.display(), error = %e, "failed to write initial worker state");
            }
            doc
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateDocument> {
        self.state.lock().unwrap_or_else(|e| {
            warn!("state store lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Stamp and write the document; failures are logged, not returned.
    fn persist(&self, doc: &mut StateDocument) {
        doc.last_updated = Utc::now();
        if let Err(e) = write_json_atomic(&self.path, &*doc) {
            warn!(path = %self.path.display(), error = %e, "failed to persist worker state");
        }
    }

    /// Record a status change for `id`, creating the record on first use.
    ///
    /// Returns the updated record.
    pub fn transition(&self, id: &str, update: StatusUpdate) -> WorkerRecord {
        let now = Utc::now();
        let mut doc = self.lock();
        let status = update.status;

        let record = match doc.bots.get_mut(id) {
            Some(record) => {
                record.apply(update, now);
                record.clone()
            }
            None => {
                let record = WorkerRecord::create(id, update, now);
                doc.bots.insert(id.to_string(), record.clone());
                record
            }
        };

        self.persist(&mut doc);
        debug!(worker_id = %id, status = %status, "worker state transition");
        record
    }

    /// Overwrite a worker's `auto_restart` flag without touching its status.
    ///
    /// Returns `None` when no record exists for `id`.
    pub fn set_auto_restart(&self, id: &str, value: bool) -> Option<WorkerRecord> {
        let mut doc = self.lock();
        let record = doc.bots.get_mut(id)?;
        record.auto_restart = value;
        record.last_updated = Utc::now();
        let record = record.clone();
        self.persist(&mut doc);
        Some(record)
    }

    /// Flip a worker's `auto_restart` flag. Returns `None` when no record
    /// exists for `id`.
    pub fn toggle_auto_restart(&self, id: &str) -> Option<WorkerRecord> {
        let mut doc = self.lock();
        let record = doc.bots.get_mut(id)?;
        record.auto_restart = !record.auto_restart;
        record.last_updated = Utc::now();
        let record = record.clone();
        self.persist(&mut doc);
        Some(record)
    }

    pub fn get(&self, id: &str) -> Option<WorkerRecord> {
        self.lock().bots.get(id).cloned()
    }

    pub fn get_all(&self) -> BTreeMap<String, WorkerRecord> {
        self.lock().bots.clone()
    }

    /// Delete a worker's record. Returns the removed record, if any.
    pub fn remove(&self, id: &str) -> Option<WorkerRecord> {
        let mut doc = self.lock();
        let removed = doc.bots.remove(id);
        if removed.is_some() {
            self.persist(&mut doc);
        }
        removed
    }

    /// Workers that were last seen running with `auto_restart` set, in id order.
    pub fn auto_start_candidates(&self) -> Vec<String> {
        self.lock()
            .bots
            .values()
            .filter(|r| r.auto_restart && r.status == WorkerStatus::Running)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Write the current document now, surfacing any error.
    pub fn flush(&self) -> Result<(), PersistError> {
        let mut doc = self.lock();
        doc.last_updated = Utc::now();
        write_json_atomic(&self.path, &*doc)
    }

    /// A copy of the whole document.
    pub fn snapshot(&self) -> StateDocument {
        self.lock().clone()
    }

    pub fn server_start_time(&self) -> Option<DateTime<Utc>> {
        self.lock().server_start_time
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.lock().last_updated
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("workers", &self.lock().bots.len())
            .finish()
    }
}

/// Parse a state document record by record.
///
/// Absent timestamps default to the load time and an absent `id` takes the
/// map key.
fn parse_document(text: &str) -> Result<StateDocument, serde_json::Error> {
    #[derive(Deserialize)]
    struct RawDocument {
        #[serde(default)]
        bots: BTreeMap<String, serde_json::Value>,
        #[serde(default = "Utc::now")]
        last_updated: DateTime<Utc>,
        #[serde(default)]
        server_start_time: Option<DateTime<Utc>>,
    }

    let raw: RawDocument = serde_json::from_str(text)?;
    let mut bots = BTreeMap::new();
    for (key, value) in raw.bots {
        match serde_json::from_value::<WorkerRecord>(value) {
            Ok(mut record) => {
                if record.id.is_empty() {
                    record.id = key.clone();
                }
                bots.insert(key, record);
            }
            Err(e) => warn!(worker_id = %key, error = %e, "dropping unreadable worker record"),
        }
    }

    Ok(StateDocument {
        bots,
        last_updated: raw.last_updated,
        server_start_time: raw.server_start_time,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StoppedBy;

    fn temp_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = StateStore::load(dir.path().join("bot_state.json"));
        (store, dir)
    }

    #[test]
    fn missing_document_is_created_on_load() {
        let (store, _dir) = temp_store();
        assert!(store.path().exists());
        assert!(store.server_start_time().is_some());
        assert!(store.get_all().is_empty());
    }

    #[test]
    fn transition_upserts_and_persists() {
        let (store, _dir) = temp_store();
        store.transition("w1", StatusUpdate::new(WorkerStatus::Starting));
        let record = store.transition(
            "w1",
            StatusUpdate::new(WorkerStatus::Running).pid(1234),
        );
        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.status_history.len(), 2);

        let reloaded = StateStore::load(store.path());
        let record = reloaded.get("w1").unwrap();
        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.pid, Some(1234));
    }

    #[test]
    fn corrupt_document_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = StateStore::load(&path);
        assert!(store.get_all().is_empty());

        // Next mutation overwrites the corrupt file with a valid document.
        store.transition("w", StatusUpdate::new(WorkerStatus::Stopped));
        let reloaded = StateStore::load(&path);
        assert!(reloaded.get("w").is_some());
    }

    #[test]
    fn partial_record_loads_next_to_full_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_state.json");
        {
            let store = StateStore::load(&path);
            store.transition("w2", StatusUpdate::new(WorkerStatus::Stopped).exit_code(0));
        }
        let mut doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        doc["bots"]["w1"] = serde_json::json!({"status": "running", "auto_restart": true});
        doc["bots"]["bad"] = serde_json::json!({"status": "exploded"});
        std::fs::write(&path, doc.to_string()).unwrap();

        let store = StateStore::load(&path);
        let w1 = store.get("w1").unwrap();
        assert_eq!(w1.id, "w1");
        assert_eq!(w1.status, WorkerStatus::Running);
        assert!(w1.status_history.is_empty());
        assert_eq!(store.get("w2").unwrap().exit_code, Some(0));
        assert!(store.get("bad").is_none());
        assert_eq!(store.auto_start_candidates(), vec!["w1".to_string()]);

        // Rewriting the document keeps every record that loaded.
        store.transition("w3", StatusUpdate::new(WorkerStatus::Starting));
        let reloaded = StateStore::load(&path);
        assert!(reloaded.get("w1").is_some());
        assert!(reloaded.get("w2").is_some());
        assert!(reloaded.get("w3").is_some());
    }

    #[test]
    fn remove_deletes_record() {
        let (store, _dir) = temp_store();
        store.transition("gone", StatusUpdate::new(WorkerStatus::Stopped));
        assert!(store.remove("gone").is_some());
        assert!(store.remove("gone").is_none());
        assert!(StateStore::load(store.path()).get("gone").is_none());
    }

    #[test]
    fn auto_start_candidates_need_running_and_flag() {
        let (store, _dir) = temp_store();
        store.transition("a", StatusUpdate::new(WorkerStatus::Running));
        store.transition(
            "b",
            StatusUpdate::new(WorkerStatus::Running).auto_restart(false),
        );
        store.transition("c", StatusUpdate::new(WorkerStatus::Crashed));
        store.transition(
            "d",
            StatusUpdate::new(WorkerStatus::Stopped).stopped_by(StoppedBy::ServerShutdown),
        );
        store.transition("e", StatusUpdate::new(WorkerStatus::Running).auto_restart(true));

        assert_eq!(store.auto_start_candidates(), vec!["a".to_string(), "e".to_string()]);
    }

    #[test]
    fn set_auto_restart_keeps_status_and_history() {
        let (store, _dir) = temp_store();
        store.transition("w", StatusUpdate::new(WorkerStatus::Running));
        let record = store.set_auto_restart("w", false).unwrap();
        assert_eq!(record.status, WorkerStatus::Running);
        assert_eq!(record.status_history.len(), 1);
        assert!(!record.auto_restart);
        assert!(store.set_auto_restart("missing", true).is_none());

        assert!(store.toggle_auto_restart("w").unwrap().auto_restart);
        assert!(!store.toggle_auto_restart("w").unwrap().auto_restart);
        assert!(store.toggle_auto_restart("missing").is_none());
    }

    #[test]
    fn persist_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot_state.json");
        let store = StateStore::load(&path);

        // Replace the document's location with a non-empty directory so that
        // every subsequent write fails.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("blocker"), "x").unwrap();

        let record = store.transition("w", StatusUpdate::new(WorkerStatus::Starting));
        assert_eq!(record.status, WorkerStatus::Starting);
        assert_eq!(store.get("w").unwrap().status, WorkerStatus::Starting);
        assert!(store.flush().is_err());
    }
}
