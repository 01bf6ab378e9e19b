//! Job handoff store: filesystem namespaces shared with the commander.

pub mod fs;
pub mod traits;

pub use fs::FsJobStore;
pub use traits::{JobStore, PendingJob};
