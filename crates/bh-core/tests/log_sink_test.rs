use std::collections::HashSet;

use bh_core::log_sink::LogSink;

#[test]
fn reopen_truncates_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path().join("logs"));

    {
        let mut first = sink.open("w").unwrap();
        first.write_line("first run").unwrap();
    }
    {
        let mut second = sink.open("w").unwrap();
        second.write_line("second run").unwrap();
    }

    let lines = sink.tail("w", 100).unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("second run"));
}

#[test]
fn lines_carry_bracketed_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path());
    let mut writer = sink.open("stamp").unwrap();
    writer.write_line("payload").unwrap();

    // Readable before the writer is dropped: every line is flushed.
    let line = &sink.tail("stamp", 1).unwrap()[0];
    assert!(line.starts_with('['));
    // "[YYYY-MM-DD HH:MM:SS] " is 22 bytes.
    assert_eq!(&line[20..22], "] ");
    assert_eq!(&line[22..], "payload");
}

#[test]
fn tail_returns_last_lines_only() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path());
    {
        let mut writer = sink.open("chatty").unwrap();
        for i in 0..250 {
            writer.write_line(&format!("line {i}")).unwrap();
        }
    }
    let lines = sink.tail("chatty", 100).unwrap();
    assert_eq!(lines.len(), 100);
    assert!(lines[0].ends_with("line 150"));
    assert!(lines[99].ends_with("line 249"));
}

#[test]
fn tail_of_missing_log_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path());
    assert!(sink.tail("nobody", 10).unwrap().is_empty());
}

#[test]
fn remove_reports_whether_file_existed() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path());
    drop(sink.open("w").unwrap());
    assert!(sink.remove("w").unwrap());
    assert!(!sink.remove("w").unwrap());
}

#[test]
fn prune_skips_kept_workers() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path());
    drop(sink.open("old").unwrap());
    drop(sink.open("live").unwrap());
    std::fs::write(dir.path().join("notes.txt"), "not a log").unwrap();

    let keep: HashSet<String> = ["live".to_string()].into_iter().collect();
    // Zero max age: every log not kept is old enough.
    std::thread::sleep(std::time::Duration::from_millis(20));
    let removed = sink
        .prune_older_than(chrono::Duration::zero(), &keep)
        .unwrap();

    assert_eq!(removed, 1);
    assert!(!sink.log_path("old").exists());
    assert!(sink.log_path("live").exists());
    assert!(dir.path().join("notes.txt").exists());
}

#[test]
fn prune_keeps_recent_logs() {
    let dir = tempfile::tempdir().unwrap();
    let sink = LogSink::new(dir.path());
    drop(sink.open("fresh").unwrap());
    let removed = sink
        .prune_older_than(chrono::Duration::days(7), &HashSet::new())
        .unwrap();
    assert_eq!(removed, 0);
}
