//! Directory-backed job store.
//!
//! Layout shared with the commander:
//! - `pending/<id>/`: job directory; eligible once it contains `.ready`
//! - `pending/<id>.abort`: abort request, kept until the runner acts on it
//! - `staging/<id>/`: claimed job, owned by this runner

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use super::traits::{JobStore, PendingJob};
use crate::error::{ClaimFailed, StoreError};
use crate::fsutil;
use crate::job::descriptor::DESCRIPTOR_FILE;
use crate::job::{Job, JobDescriptor, JobId};

/// Marker the commander writes once a job directory is complete.
pub const READY_FILE: &str = ".ready";

/// Status file holding the job's exit code.
pub const DONE_FILE: &str = ".done";

/// Suffix of abort request files in the pending directory.
pub const ABORT_SUFFIX: &str = ".abort";

/// Job store over pending and staging directories.
#[derive(Debug, Clone)]
pub struct FsJobStore {
    pending_dir: PathBuf,
    staging_dir: PathBuf,
}

impl FsJobStore {
    pub fn new(pending_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            pending_dir,
            staging_dir,
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    fn abort_marker(&self, id: &JobId) -> PathBuf {
        self.pending_dir.join(format!("{id}{ABORT_SUFFIX}"))
    }

    /// Build a job from a directory it now owns.
    async fn load_job(id: JobId, dir: PathBuf) -> Job {
        let descriptor_path = dir.join(DESCRIPTOR_FILE);
        match fs::read_to_string(&descriptor_path).await {
            Ok(raw) => match JobDescriptor::parse(&raw) {
                Ok(descriptor) => Job::new(id, dir, descriptor),
                Err(reason) => {
                    warn!(job_id = %id, error = %reason, "Invalid job descriptor");
                    Job::with_descriptor_error(id, dir, reason)
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Job::new(id, dir, JobDescriptor::default())
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Unreadable job descriptor");
                Job::with_descriptor_error(id, dir, format!("unreadable {DESCRIPTOR_FILE}: {e}"))
            }
        }
    }
}

fn scan_error(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Scan {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn list_pending(&self) -> Result<Vec<PendingJob>, StoreError> {
        let mut entries = fs::read_dir(&self.pending_dir)
            .await
            .map_err(scan_error(&self.pending_dir))?;

        let mut pending = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(scan_error(&self.pending_dir))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                warn!(entry = ?name, "Skipping non UTF-8 entry in pending directory");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            // A vanished entry was claimed elsewhere between readdir and stat.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let id = match JobId::parse(name) {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "Ignoring pending directory with invalid name");
                    continue;
                }
            };

            if !fs::try_exists(entry.path().join(READY_FILE)).await.unwrap_or(false) {
                debug!(job_id = %id, "Not starting work, no {READY_FILE} file found");
                continue;
            }

            pending.push(PendingJob {
                id,
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        pending.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(pending)
    }

    async fn claim(&self, id: &JobId) -> Result<Job, ClaimFailed> {
        let from = self.pending_dir.join(id);
        let to = self.staging_path(id);

        let (src, dst) = (from.clone(), to.clone());
        let renamed = tokio::task::spawn_blocking(move || fsutil::rename_noreplace(&src, &dst))
            .await
            .unwrap_or_else(|e| Err(io::Error::other(e)));

        match renamed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ClaimFailed::Vanished { id: id.clone() });
            }
            Err(e) if fsutil::is_target_taken(&e) => {
                return Err(ClaimFailed::AlreadyStaged { id: id.clone() });
            }
            Err(source) => {
                return Err(ClaimFailed::Io {
                    id: id.clone(),
                    source,
                });
            }
        }

        let stale_done = to.join(DONE_FILE);
        if fs::try_exists(&stale_done).await.unwrap_or(false) {
            warn!(job_id = %id, "Found old {DONE_FILE} file in new job, removing");
            if let Err(e) = fs::remove_file(&stale_done).await {
                warn!(job_id = %id, error = %e, "Failed to remove stale status file");
            }
        }

        debug!(job_id = %id, staging = %to.display(), "Claimed job");
        Ok(Self::load_job(id.clone(), to).await)
    }

    async fn abort_requests(&self) -> Result<Vec<JobId>, StoreError> {
        let mut entries = fs::read_dir(&self.pending_dir)
            .await
            .map_err(scan_error(&self.pending_dir))?;

        let mut aborts = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(scan_error(&self.pending_dir))?
        {
            let name = entry.file_name();
            let Some(raw_id) = name.to_str().and_then(|n| n.strip_suffix(ABORT_SUFFIX)) else {
                continue;
            };
            // A job directory may legitimately be named `<x>.abort`.
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Ok(id) = JobId::parse(raw_id) else {
                warn!(entry = raw_id, "Ignoring abort request with invalid job id");
                continue;
            };
            aborts.push(id);
        }
        aborts.sort();
        Ok(aborts)
    }

    async fn clear_abort_request(&self, id: &JobId) -> Result<(), StoreError> {
        let marker = self.abort_marker(id);
        match fs::remove_file(&marker).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_pending(&self, id: &JobId) -> bool {
        fs::metadata(self.pending_dir.join(id))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    async fn staged_jobs(&self) -> Result<Vec<JobId>, StoreError> {
        let mut entries = fs::read_dir(&self.staging_dir)
            .await
            .map_err(scan_error(&self.staging_dir))?;

        let mut staged = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(scan_error(&self.staging_dir))?
        {
            if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|n| JobId::parse(n).ok()) {
                staged.push(id);
            }
        }
        staged.sort();
        Ok(staged)
    }

    async fn load_staged(&self, id: &JobId) -> Result<Job, StoreError> {
        let dir = self.staging_path(id);
        fs::metadata(&dir).await?;
        Ok(Self::load_job(id.clone(), dir).await)
    }

    fn staging_path(&self, id: &JobId) -> PathBuf {
        self.staging_dir.join(id)
    }
}
