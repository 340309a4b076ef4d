use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{Duration, Local};
use tracing::{debug, info, warn};

/// Timestamp prefix used on every log line.
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, thiserror::Error)]
pub enum LogSinkError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LogSinkError + '_ {
    move |source| LogSinkError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Directory of per-worker log files (`<logs_dir>/<worker_id>.log`).
///
/// The sink does not track open writers; the supervisor guarantees a single
/// runner, and therefore a single writer, per worker.
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, worker_id: &str) -> PathBuf {
        self.dir.join(format!("{worker_id}.log"))
    }

    /// Open a fresh log for a new run, truncating any previous one.
    pub fn open(&self, worker_id: &str) -> Result<LogWriter, LogSinkError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.log_path(worker_id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err(&path))?;
        debug!(worker_id, path = %path.display(), "worker log opened");
        Ok(LogWriter {
            worker_id: worker_id.to_string(),
            path,
            file,
        })
    }

    /// Last `max_lines` lines of a worker's log. A missing log yields an
    /// empty list.
    pub fn tail(&self, worker_id: &str, max_lines: usize) -> Result<Vec<String>, LogSinkError> {
        let path = self.log_path(worker_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&path)(e)),
        };
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }

    /// Delete a worker's log. Returns `true` if a file was removed.
    pub fn remove(&self, worker_id: &str) -> Result<bool, LogSinkError> {
        let path = self.log_path(worker_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Delete `.log` files last modified more than `max_age` ago, skipping
    /// workers named in `keep`. Returns the number of files removed.
    pub fn prune_older_than(
        &self,
        max_age: Duration,
        keep: &HashSet<String>,
    ) -> Result<usize, LogSinkError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };
        let max_age = max_age.to_std().unwrap_or_default();
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if keep.contains(stem) {
                continue;
            }
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age > max_age {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to prune log"),
                }
            }
        }

        if removed > 0 {
            info!(removed, dir = %self.dir.display(), "pruned old worker logs");
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// LogWriter
// ---------------------------------------------------------------------------

/// Exclusive writer for one run of one worker. Flushed after every line and
/// closed on drop.
pub struct LogWriter {
    worker_id: String,
    path: PathBuf,
    file: File,
}

impl LogWriter {
    /// Write `text` prefixed with `[YYYY-MM-DD HH:MM:SS]` and flush.
    ///
    /// Trailing line terminators in `text` are dropped so each call produces
    /// exactly one physical line.
    pub fn write_line(&mut self, text: &str) -> io::Result<()> {
        let text = text.trim_end_matches(['\r', '\n']);
        let stamp = Local::now().format(LOG_TIMESTAMP_FORMAT);
        writeln!(self.file, "[{stamp}] {text}")?;
        self.file.flush()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.file.sync_data() {
            warn!(worker_id = %self.worker_id, error = %e, "failed to sync worker log on close");
        }
        debug!(worker_id = %self.worker_id, "worker log closed");
    }
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("worker_id", &self.worker_id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_line_strips_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::new(dir.path());
        {
            let mut writer = sink.open("w").unwrap();
            writer.write_line("hello\r\n").unwrap();
            writer.write_line("world").unwrap();
        }
        let lines = sink.tail("w", 10).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("] hello"));
        assert!(lines[1].ends_with("] world"));
    }
}
