use bh_core::state_store::StateStore;
use bh_core::types::{StatusUpdate, StoppedBy, WorkerStatus, MAX_STATUS_HISTORY};

fn temp_store() -> (StateStore, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = StateStore::load(dir.path().join("bot_state.json"));
    (store, dir)
}

#[test]
fn history_stays_bounded_and_chronological() {
    let (store, _dir) = temp_store();
    for i in 0..75 {
        let status = if i % 2 == 0 {
            WorkerStatus::Starting
        } else {
            WorkerStatus::Running
        };
        store.transition("busy", StatusUpdate::new(status));
    }

    let record = store.get("busy").unwrap();
    assert_eq!(record.status_history.len(), MAX_STATUS_HISTORY);
    assert!(record
        .status_history
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));
    assert_eq!(record.status, record.last_entry().unwrap().status);
}

#[test]
fn status_matches_last_history_entry_after_reload() {
    let (store, _dir) = temp_store();
    store.transition("w", StatusUpdate::new(WorkerStatus::Starting));
    store.transition("w", StatusUpdate::new(WorkerStatus::Running).pid(99));
    store.transition("w", StatusUpdate::new(WorkerStatus::Crashed).exit_code(137));

    let reloaded = StateStore::load(store.path());
    let record = reloaded.get("w").unwrap();
    assert_eq!(record.status, WorkerStatus::Crashed);
    assert_eq!(record.exit_code, Some(137));
    assert_eq!(record.last_entry().unwrap().status, WorkerStatus::Crashed);
    assert_eq!(record.last_entry().unwrap().details.exit_code, Some(137));
}

#[test]
fn server_start_time_survives_reload() {
    let (store, _dir) = temp_store();
    let started = store.server_start_time().unwrap();
    let reloaded = StateStore::load(store.path());
    assert_eq!(reloaded.server_start_time(), Some(started));
}

#[test]
fn shutdown_correction_clears_auto_start_candidacy() {
    let (store, _dir) = temp_store();
    store.transition("w", StatusUpdate::new(WorkerStatus::Running).auto_restart(true));
    assert_eq!(store.auto_start_candidates(), vec!["w".to_string()]);

    store.transition(
        "w",
        StatusUpdate::new(WorkerStatus::Stopped).stopped_by(StoppedBy::ServerShutdown),
    );
    assert!(store.auto_start_candidates().is_empty());
    assert_eq!(
        store.get("w").unwrap().stopped_by,
        Some(StoppedBy::ServerShutdown)
    );
}

#[test]
fn concurrent_transitions_lose_no_entries() {
    let (store, _dir) = temp_store();
    let store = std::sync::Arc::new(store);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    store.transition(&format!("w{t}"), StatusUpdate::new(WorkerStatus::Running));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let reloaded = StateStore::load(store.path());
    for t in 0..4 {
        assert_eq!(
            reloaded.get(&format!("w{t}")).unwrap().status_history.len(),
            10
        );
    }
}
