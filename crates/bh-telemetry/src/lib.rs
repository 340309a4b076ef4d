//! Logging setup shared by the bothost binary and its tests.
//!
//! Supervisor diagnostics go through `tracing`; worker output never does.
//! Workers write to their own files via `bh_core::log_sink`.

pub mod logging;
