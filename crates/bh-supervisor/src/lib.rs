//! Worker process supervision.
//!
//! [`Supervisor`] is the only entry point. It owns the in-memory registry of
//! running workers, hands each launch to a runner task, and records every
//! status change in the [`bh_core::state_store::StateStore`].

pub mod entry_point;
pub mod error;
mod registry;
mod runner;
pub mod supervisor;

pub use error::{Result, Started, Stopped, SupervisorError};
pub use registry::RunningInfo;
pub use supervisor::{AutoStartReport, SystemState, Supervisor};
