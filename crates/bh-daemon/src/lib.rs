//! The `bothost` daemon: boot sequence, signal handling, and the operator
//! subcommands that read the supervisor's files directly.

pub mod commands;
pub mod daemon;
pub mod shutdown;
