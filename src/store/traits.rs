//! `JobStore` trait: the job handoff namespace shared with the commander.

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{ClaimFailed, StoreError};
use crate::job::{Job, JobId};

/// A job directory that is ready to be claimed.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub id: JobId,
    pub modified: SystemTime,
}

/// Backend-agnostic job handoff store.
///
/// Claim is the only mutation of the shared pending namespace and must be
/// atomic: when two runners race on one id, exactly one wins.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fresh scan of ready pending jobs, oldest first.
    async fn list_pending(&self) -> Result<Vec<PendingJob>, StoreError>;

    /// Take ownership of a pending job by moving it into the staging area.
    async fn claim(&self, id: &JobId) -> Result<Job, ClaimFailed>;

    /// Abort requests left by the commander. Markers stay until cleared.
    async fn abort_requests(&self) -> Result<Vec<JobId>, StoreError>;

    /// Remove the abort marker for `id` once it has been acted on.
    async fn clear_abort_request(&self, id: &JobId) -> Result<(), StoreError>;

    /// Whether `id` still sits in the pending namespace.
    async fn is_pending(&self, id: &JobId) -> bool;

    /// Jobs currently sitting in the staging area.
    async fn staged_jobs(&self) -> Result<Vec<JobId>, StoreError>;

    /// Rebuild a job from its staging directory (startup recovery).
    async fn load_staged(&self, id: &JobId) -> Result<Job, StoreError>;

    /// Staging directory for a job id.
    fn staging_path(&self, id: &JobId) -> PathBuf;
}
