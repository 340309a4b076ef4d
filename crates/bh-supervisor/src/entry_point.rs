//! Choosing which script in a worker directory to launch.
//!
//! Eligible files are regular files whose extension matches
//! `runtime.script_extension`. A file whose stem matches one of
//! `runtime.entry_points` wins, in priority order; otherwise the first
//! eligible file by name is used.

use std::io;
use std::path::{Path, PathBuf};

use bh_core::config::RuntimeConfig;

#[derive(Debug, thiserror::Error)]
pub enum EntryPointError {
    #[error("worker directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("no .{extension} files in {}", dir.display())]
    NoScripts { dir: PathBuf, extension: String },

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Eligible script files in `dir`, sorted by file name.
pub fn list_scripts(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, EntryPointError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(EntryPointError::MissingDirectory(dir.to_path_buf()))
        }
        Err(source) => {
            return Err(EntryPointError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| EntryPointError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(extension));
        if matches_ext && path.is_file() {
            scripts.push(path);
        }
    }
    scripts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(scripts)
}

/// Resolve the script to launch for the worker in `dir`.
pub fn resolve_entry_point(dir: &Path, runtime: &RuntimeConfig) -> Result<PathBuf, EntryPointError> {
    let scripts = list_scripts(dir, &runtime.script_extension)?;

    for preferred in &runtime.entry_points {
        let hit = scripts.iter().find(|path| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .is_some_and(|stem| stem.eq_ignore_ascii_case(preferred))
        });
        if let Some(path) = hit {
            return Ok(path.clone());
        }
    }

    scripts
        .into_iter()
        .next()
        .ok_or_else(|| EntryPointError::NoScripts {
            dir: dir.to_path_buf(),
            extension: runtime.script_extension.clone(),
        })
}
