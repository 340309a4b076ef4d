//! Operator subcommands. Each renders its output as a string; `main` prints
//! it.

pub mod backup;
pub mod config;
pub mod logs;
pub mod status;
