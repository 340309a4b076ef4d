//! One worker run, from entry-point resolution to the terminal transition.
//!
//! The runner is the single writer of its run's terminal status and of its
//! registry deregistration. `stop()` only asks; the runner decides how far
//! the run got and records the outcome.

use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bh_core::config::RuntimeConfig;
use bh_core::log_sink::LogWriter;
use bh_core::types::{StatusUpdate, StoppedBy, WorkerStatus};
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry_point::resolve_entry_point;
use crate::registry::RunControl;
use crate::supervisor::Supervisor;

/// How long to keep reading output after the worker exits. A descendant
/// that inherited the pipe can hold it open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// RunOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RunOutcome {
    /// The process ran and exited.
    Exited { code: i32, stop_requested: bool },
    /// A stop arrived before any process was spawned.
    Cancelled,
    /// The run failed before or while launching.
    Failed(String),
}

impl RunOutcome {
    pub fn to_update(&self) -> StatusUpdate {
        match self {
            RunOutcome::Exited {
                code,
                stop_requested: true,
            } => StatusUpdate::new(WorkerStatus::Stopped)
                .exit_code(*code)
                .stopped_by(StoppedBy::User),
            RunOutcome::Exited { code: 0, .. } => {
                StatusUpdate::new(WorkerStatus::Stopped).exit_code(0)
            }
            RunOutcome::Exited { code, .. } => {
                StatusUpdate::new(WorkerStatus::Crashed).exit_code(*code)
            }
            RunOutcome::Cancelled => {
                StatusUpdate::new(WorkerStatus::Stopped).stopped_by(StoppedBy::User)
            }
            RunOutcome::Failed(message) => {
                StatusUpdate::new(WorkerStatus::Error).error(message.clone())
            }
        }
    }
}

/// Exit code of a finished process; a signal-terminated process reports the
/// negated signal number.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

// ---------------------------------------------------------------------------
// RunGuard
// ---------------------------------------------------------------------------

/// Records the terminal transition and deregisters the run exactly once,
/// including when the runner task is dropped mid-run.
struct RunGuard {
    sup: Supervisor,
    worker_id: String,
    run_id: Uuid,
    exited_tx: watch::Sender<bool>,
    finished: bool,
}

impl RunGuard {
    fn finish(&mut self, outcome: &RunOutcome) -> Option<WorkerStatus> {
        self.finished = true;
        let status = self
            .sup
            .finish_run(&self.worker_id, self.run_id, outcome.to_update());
        self.exited_tx.send_replace(true);
        status
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(worker_id = %self.worker_id, "runner dropped before finishing");
            self.finish(&RunOutcome::Failed("runner task aborted".into()));
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Execute one run of `worker_id` from `dir`. Spawned by the supervisor
/// after it has installed the run's handle.
pub(crate) async fn run(sup: Supervisor, worker_id: String, dir: std::path::PathBuf, control: RunControl) {
    let RunControl {
        run_id,
        mut stop_rx,
        exited_tx,
    } = control;
    let mut guard = RunGuard {
        sup: sup.clone(),
        worker_id: worker_id.clone(),
        run_id,
        exited_tx,
        finished: false,
    };

    let outcome = match sup.logs().open(&worker_id) {
        Ok(log) => execute(&sup, &worker_id, &dir, run_id, &mut stop_rx, log).await,
        Err(e) => RunOutcome::Failed(e.to_string()),
    };
    info!(worker_id = %worker_id, outcome = ?outcome, "worker run finished");

    match guard.finish(&outcome) {
        Some(WorkerStatus::Crashed) => sup.schedule_crash_restart(&worker_id),
        Some(WorkerStatus::Stopped) => sup.reset_crash_count(&worker_id),
        _ => {}
    }
}

/// Steps 1-5 of a run. The log writer is dropped, and so closed, before
/// this returns.
async fn execute(
    sup: &Supervisor,
    worker_id: &str,
    dir: &Path,
    run_id: Uuid,
    stop_rx: &mut watch::Receiver<bool>,
    mut log: LogWriter,
) -> RunOutcome {
    let runtime = &sup.config().runtime;

    note(&mut log, &format!("Starting bot: {worker_id}"));
    note(&mut log, &format!("Interpreter: {}", runtime.interpreter));
    note(&mut log, &format!("Working directory: {}", dir.display()));

    let script = match resolve_entry_point(dir, runtime) {
        Ok(script) => script,
        Err(e) => {
            note(&mut log, &format!("ERROR: {e}"));
            return RunOutcome::Failed(e.to_string());
        }
    };
    let script_name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    note(&mut log, &format!("Running script: {script_name}"));

    if dir.join(&runtime.dependency_manifest).is_file()
        && install_dependencies(worker_id, dir, runtime, stop_rx, &mut log).await
    {
        return RunOutcome::Cancelled;
    }
    if *stop_rx.borrow() {
        note(&mut log, "Stop requested before launch");
        return RunOutcome::Cancelled;
    }

    let command_line = display_command(runtime, &script_name);
    note(&mut log, &format!("Command: {command_line}"));

    let mut command = Command::new(&runtime.interpreter);
    command
        .args(&runtime.interpreter_args)
        .arg(&script_name)
        .current_dir(dir)
        .envs(&runtime.env)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let (mut child, output) = match spawn_with_merged_output(command) {
        Ok(spawned) => spawned,
        Err(e) => {
            let message = format!("failed to launch {command_line}: {e}");
            note(&mut log, &format!("ERROR: {message}"));
            return RunOutcome::Failed(message);
        }
    };
    let pid = child.id();
    match pid {
        Some(pid) => note(&mut log, &format!("Process started with PID: {pid}")),
        None => note(&mut log, "Process started"),
    }

    if !sup.mark_running(worker_id, run_id, pid, &command_line, Utc::now()) {
        // The handle was force-removed while we were launching.
        warn!(worker_id, "run no longer registered, killing fresh process");
        let _ = child.start_kill();
        let _ = child.wait().await;
        return RunOutcome::Cancelled;
    }

    let grace = sup.config().supervisor.stop_grace();
    let waited = pump(worker_id, &mut child, output, stop_rx, grace, &mut log).await;

    match waited {
        Ok((status, stop_requested)) => {
            let code = exit_code(status);
            note(&mut log, &format!("Process ended with code: {code}"));
            RunOutcome::Exited {
                code,
                stop_requested,
            }
        }
        Err(e) => {
            let message = format!("failed to wait for process: {e}");
            note(&mut log, &format!("ERROR: {message}"));
            RunOutcome::Failed(message)
        }
    }
}

// ---------------------------------------------------------------------------
// Output pump
// ---------------------------------------------------------------------------

/// Copy the merged output into the log until the process exits, honoring a
/// stop request with SIGTERM and, after `grace`, a kill.
///
/// Returns the exit status and whether a stop was requested.
async fn pump(
    worker_id: &str,
    child: &mut Child,
    output: pipe::Receiver,
    stop_rx: &mut watch::Receiver<bool>,
    grace: Duration,
    log: &mut LogWriter,
) -> io::Result<(ExitStatus, bool)> {
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();
    let mut eof = false;
    let mut stop_sent = false;
    let mut killed = false;
    let mut kill_at = Instant::now();

    let status = loop {
        tokio::select! {
            read = reader.read_until(b'\n', &mut line), if !eof => match read {
                Ok(0) => eof = true,
                Ok(_) => {
                    note(log, &String::from_utf8_lossy(&line));
                    line.clear();
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "worker output pipe failed");
                    eof = true;
                }
            },
            status = child.wait() => break status?,
            _ = stop_requested(stop_rx), if !stop_sent => {
                stop_sent = true;
                kill_at = Instant::now() + grace;
                note(log, "Stop requested, sending SIGTERM");
                match child.id() {
                    Some(pid) => {
                        if let Err(e) = send_terminate(pid) {
                            debug!(worker_id, pid, error = %e, "SIGTERM not delivered");
                        }
                    }
                    None => debug!(worker_id, "process already reaped"),
                }
            },
            _ = tokio::time::sleep_until(kill_at), if stop_sent && !killed => {
                killed = true;
                warn!(worker_id, grace_ms = grace.as_millis() as u64, "grace period elapsed, killing worker");
                note(log, "Grace period elapsed, killing process");
                if let Err(e) = child.start_kill() {
                    debug!(worker_id, error = %e, "kill not delivered");
                }
            },
        }
    };

    if !eof {
        let drain = async {
            loop {
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        note(log, &String::from_utf8_lossy(&line));
                        line.clear();
                    }
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(worker_id, "output still open after exit, abandoning it");
        }
    }

    Ok((status, stop_sent))
}

/// Spawn `command` with stdout and stderr sharing one pipe.
fn spawn_with_merged_output(mut command: Command) -> io::Result<(Child, pipe::Receiver)> {
    let (reader, writer) = io::pipe()?;
    command.stdout(writer.try_clone()?).stderr(writer);
    let child = command.spawn()?;
    // `command` holds the parent's copies of the write end; the reader only
    // sees EOF once they are closed.
    drop(command);
    let reader = pipe::Receiver::from_file(std::fs::File::from(OwnedFd::from(reader)))?;
    Ok((child, reader))
}

fn send_terminate(pid: u32) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Resolves once a stop has been requested. Never resolves if the request
/// side is gone.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Best-effort install from the worker's dependency manifest.
///
/// Failures are logged and the launch goes ahead. Returns `true` when a stop
/// request interrupted the install; the installer is killed on drop.
async fn install_dependencies(
    worker_id: &str,
    dir: &Path,
    runtime: &RuntimeConfig,
    stop_rx: &mut watch::Receiver<bool>,
    log: &mut LogWriter,
) -> bool {
    let argv = runtime.install_command();
    let Some((program, args)) = argv.split_first() else {
        return false;
    };

    note(log, &format!("Installing dependencies from {}", runtime.dependency_manifest));
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(dir)
        .envs(&runtime.env)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    tokio::select! {
        result = command.output() => {
            match result {
                Ok(out) if out.status.success() => note(log, "Dependencies installed"),
                Ok(out) => {
                    let code = exit_code(out.status);
                    warn!(worker_id, code, "dependency install failed, launching anyway");
                    note(log, &format!("Dependency install failed with code {code}"));
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    let lines: Vec<&str> = stderr.lines().collect();
                    for line in &lines[lines.len().saturating_sub(5)..] {
                        note(log, line);
                    }
                }
                Err(e) => {
                    warn!(worker_id, error = %e, "dependency installer could not run");
                    note(log, &format!("Dependency install could not run: {e}"));
                }
            }
            false
        }
        _ = stop_requested(stop_rx) => {
            note(log, "Stop requested during dependency install");
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn display_command(runtime: &RuntimeConfig, script_name: &str) -> String {
    std::iter::once(runtime.interpreter.as_str())
        .chain(runtime.interpreter_args.iter().map(String::as_str))
        .chain(std::iter::once(script_name))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write one log line; a failing log never takes the worker down.
fn note(log: &mut LogWriter, text: &str) {
    if let Err(e) = log.write_line(text) {
        warn!(worker_id = %log.worker_id(), error = %e, "failed to write worker log");
    }
}
