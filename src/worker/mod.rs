//! Worker system: running claimed jobs.
//!
//! Core components:
//! - `supervisor`: spawns the tool in its own process group, enforces timeout and cancellation
//! - `collector`: drains stdout/stderr, inventories artifacts, stages the bundle
//! - `slot`: bounded slot table (one job per slot)
//! - `runner`: poll loop (claim, dispatch, publish, shutdown)

pub mod collector;
pub mod runner;
pub mod slot;
pub mod supervisor;

pub use collector::OutputCollector;
pub use runner::{RunSummary, RunnerLoop};
pub use slot::{ActiveJob, RunnerSlot, SlotTable};
pub use supervisor::{Outcome, ProcessHandle, ProcessSupervisor};
