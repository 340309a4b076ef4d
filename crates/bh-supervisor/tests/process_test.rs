use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use bh_core::config::{HostConfig, PathsConfig};
use bh_core::types::{StoppedBy, WorkerRecord, WorkerStatus};
use bh_supervisor::Supervisor;

fn test_config(root: &Path) -> HostConfig {
    let mut config = HostConfig::default();
    config.paths = PathsConfig::rooted_at(root);
    config.runtime.interpreter = "sh".into();
    config.runtime.script_extension = "sh".into();
    config.runtime.env = BTreeMap::from([("BOT_GREETING".to_string(), "hi".to_string())]);
    config.supervisor.stop_grace_ms = 300;
    config
}

fn harness_with(edit: impl FnOnce(&mut HostConfig)) -> (Supervisor, tempfile::TempDir) {
    let root = tempfile::tempdir().expect("create temp dir");
    let mut config = test_config(root.path());
    edit(&mut config);
    (Supervisor::open(config), root)
}

fn write_bot(sup: &Supervisor, id: &str, files: &[(&str, &str)]) {
    let dir = sup.config().paths.bots_dir().join(id);
    std::fs::create_dir_all(&dir).unwrap();
    for (name, body) in files {
        std::fs::write(dir.join(name), body).unwrap();
    }
}

async fn wait_for(sup: &Supervisor, what: &str, cond: impl Fn(&Supervisor) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond(sup) {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_finished(sup: &Supervisor, id: &str) -> WorkerRecord {
    wait_for(sup, "run to finish", |s| !s.is_running(id)).await;
    sup.status(id).unwrap()
}

fn log_text(sup: &Supervisor, id: &str) -> String {
    sup.tail_log(id, Some(1_000)).unwrap().join("\n")
}

#[tokio::test]
async fn stdout_and_stderr_share_one_log() {
    let (sup, _root) = harness_with(|_| {});
    write_bot(
        &sup,
        "both",
        &[("main.sh", "echo to-stdout\necho to-stderr >&2\necho \"$BOT_GREETING from $(pwd)\"\n")],
    );

    sup.start("both", true).unwrap();
    wait_finished(&sup, "both").await;

    let log = log_text(&sup, "both");
    assert!(log.contains("] to-stdout"));
    assert!(log.contains("] to-stderr"));
    // env and working directory come from the host config and the bot dir
    assert!(log.contains("hi from "));
    assert!(log.contains("/bots/both"));
    assert!(log.contains("Running script: main.sh"));
}

#[tokio::test]
async fn each_run_starts_a_fresh_log() {
    let (sup, _root) = harness_with(|_| {});
    write_bot(&sup, "fresh", &[("main.sh", "echo first-run\n")]);
    sup.start("fresh", true).unwrap();
    wait_finished(&sup, "fresh").await;

    write_bot(&sup, "fresh", &[("main.sh", "echo second-run\n")]);
    sup.start("fresh", true).unwrap();
    wait_finished(&sup, "fresh").await;

    let log = log_text(&sup, "fresh");
    assert!(!log.contains("first-run"));
    assert!(log.contains("second-run"));
    assert_eq!(log.matches("Starting bot: fresh").count(), 1);
}

#[tokio::test]
async fn stop_escalates_to_kill_after_grace() {
    let (sup, _root) = harness_with(|_| {});
    write_bot(&sup, "stubborn", &[("main.sh", "trap '' TERM\nexec sleep 30\n")]);

    sup.start("stubborn", true).unwrap();
    wait_for(&sup, "bot to run", |s| {
        s.status("stubborn")
            .is_ok_and(|r| r.status == WorkerStatus::Running)
    })
    .await;

    let began = Instant::now();
    let stopped = sup.stop("stubborn").await.unwrap();
    let took = began.elapsed();

    assert!(took >= Duration::from_millis(300), "killed before grace: {took:?}");
    assert!(took < Duration::from_secs(5), "stop took {took:?}");
    assert_eq!(stopped.exit_code, Some(-9));

    let record = sup.status("stubborn").unwrap();
    assert_eq!(record.status, WorkerStatus::Stopped);
    assert_eq!(record.stopped_by, Some(StoppedBy::User));
    assert!(log_text(&sup, "stubborn").contains("Grace period elapsed"));
}

#[tokio::test]
async fn failed_install_does_not_abort_launch() {
    let (sup, _root) = harness_with(|c| {
        c.runtime.install_command = Some(vec![
            "sh".into(),
            "-c".into(),
            "echo broken index >&2; exit 1".into(),
        ]);
    });
    write_bot(
        &sup,
        "deps",
        &[("requirements.txt", "requests\n"), ("main.sh", "echo launched\n")],
    );

    sup.start("deps", true).unwrap();
    let record = wait_finished(&sup, "deps").await;

    assert_eq!(record.status, WorkerStatus::Stopped);
    assert_eq!(record.exit_code, Some(0));
    let log = log_text(&sup, "deps");
    assert!(log.contains("Dependency install failed with code 1"));
    assert!(log.contains("broken index"));
    assert!(log.contains("] launched"));
}

#[tokio::test]
async fn successful_install_runs_in_bot_directory() {
    let (sup, _root) = harness_with(|c| {
        c.runtime.install_command = Some(vec![
            "sh".into(),
            "-c".into(),
            "test -f requirements.txt && touch installed.marker".into(),
        ]);
    });
    write_bot(
        &sup,
        "deps",
        &[("requirements.txt", "requests\n"), ("main.sh", "test -f installed.marker\n")],
    );

    sup.start("deps", true).unwrap();
    let record = wait_finished(&sup, "deps").await;

    assert_eq!(record.exit_code, Some(0));
    assert!(log_text(&sup, "deps").contains("Dependencies installed"));
}

#[tokio::test]
async fn stop_during_install_skips_launch() {
    let (sup, _root) = harness_with(|c| {
        c.runtime.install_command = Some(vec!["sh".into(), "-c".into(), "exec sleep 30".into()]);
    });
    write_bot(
        &sup,
        "slow",
        &[("requirements.txt", "numpy\n"), ("main.sh", "echo should-not-run\n")],
    );

    sup.start("slow", true).unwrap();
    wait_for(&sup, "install to begin", |s| {
        log_text(s, "slow").contains("Installing dependencies")
    })
    .await;

    let began = Instant::now();
    let stopped = sup.stop("slow").await.unwrap();
    assert!(began.elapsed() < Duration::from_secs(5));
    assert_eq!(stopped.exit_code, None);

    let record = sup.status("slow").unwrap();
    assert_eq!(record.status, WorkerStatus::Stopped);
    assert_eq!(record.stopped_by, Some(StoppedBy::User));
    assert!(record.pid.is_none());
    let log = log_text(&sup, "slow");
    assert!(log.contains("Stop requested during dependency install"));
    assert!(!log.contains("should-not-run"));
}

#[tokio::test]
async fn stop_right_after_start_is_honored() {
    let (sup, _root) = harness_with(|_| {});
    write_bot(&sup, "racy", &[("main.sh", "exec sleep 30\n")]);

    sup.start("racy", true).unwrap();
    sup.stop("racy").await.unwrap();

    assert!(!sup.is_running("racy"));
    let record = sup.status("racy").unwrap();
    assert_eq!(record.status, WorkerStatus::Stopped);
    assert_eq!(record.stopped_by, Some(StoppedBy::User));
}

#[tokio::test]
async fn descendant_holding_output_does_not_hang_runner() {
    let (sup, _root) = harness_with(|_| {});
    // The background sleep inherits the output pipe and outlives the script.
    write_bot(&sup, "forker", &[("main.sh", "sleep 3 &\necho parent-done\nexit 0\n")]);

    let began = Instant::now();
    sup.start("forker", true).unwrap();
    let record = wait_finished(&sup, "forker").await;

    assert!(began.elapsed() < Duration::from_secs(2));
    assert_eq!(record.status, WorkerStatus::Stopped);
    assert!(log_text(&sup, "forker").contains("parent-done"));
}

#[tokio::test]
async fn unlaunchable_interpreter_is_an_error() {
    let (sup, _root) = harness_with(|c| {
        c.runtime.interpreter = "/nonexistent/interpreter".into();
    });
    write_bot(&sup, "broken", &[("main.sh", "exit 0\n")]);

    sup.start("broken", true).unwrap();
    let record = wait_finished(&sup, "broken").await;

    assert_eq!(record.status, WorkerStatus::Error);
    assert!(record.error.unwrap().contains("failed to launch"));
    assert!(log_text(&sup, "broken").contains("ERROR:"));
}
