//! Job model: identifiers, descriptors and the lifecycle state machine.
//!
//! - `id`: validated orchestrator job ids
//! - `descriptor`: optional `job.json` and invocation resolution
//! - `state`: `Job` and its state machine (Pending → Running → terminal)

pub mod descriptor;
pub mod id;
pub mod state;

pub use descriptor::{Invocation, JobDescriptor};
pub use id::JobId;
pub use state::{Job, JobState, StateTransition};
