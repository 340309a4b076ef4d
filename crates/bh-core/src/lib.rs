//! Core building blocks for the bothost worker supervisor.
//!
//! - **types**: worker records, statuses, and status history entries
//! - **state_store**: durable per-worker state (`bot_state.json`)
//! - **settings**: dotted-path runtime settings (`bot_config.json`)
//! - **config**: host configuration loaded from TOML
//! - **log_sink**: per-worker timestamped log files
//! - **lockfile**: single-supervisor lock on the data directory

pub mod config;
pub mod lockfile;
pub mod log_sink;
pub mod persist;
pub mod settings;
pub mod state_store;
pub mod types;
