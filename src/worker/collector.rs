//! Output capture and bundle staging.
//!
//! stdout and stderr are drained into `job.out` / `job.err` by two tasks
//! that run for as long as the pipes are open, so a chatty tool never
//! blocks on a full pipe. `finalize` waits for both drains before it
//! inventories the directory, so the manifest always covers the tail of
//! the output.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bundle::{
    Artifact, ArtifactKind, BundleManifest, MANIFEST_FILE, STDERR_FILE, STDOUT_FILE, StagedBundle,
    status_code,
};
use crate::error::StagingError;
use crate::fsutil;
use crate::job::descriptor::{DEFAULT_JOB_FILE, DESCRIPTOR_FILE};
use crate::job::{Job, JobState};
use crate::store::fs::{DONE_FILE, READY_FILE};
use crate::worker::supervisor::{Outcome, ProcessHandle};

/// Files owned by the commander/runner protocol, never listed as produced.
const RESERVED_FILES: &[&str] = &[
    DEFAULT_JOB_FILE,
    DESCRIPTOR_FILE,
    READY_FILE,
    DONE_FILE,
    STDOUT_FILE,
    STDERR_FILE,
    MANIFEST_FILE,
];

/// Size and mtime of the files present before the tool started.
type Snapshot = HashMap<PathBuf, (u64, SystemTime)>;

struct Drain {
    path: PathBuf,
    handle: JoinHandle<io::Result<u64>>,
}

/// Captures one job's output into its staging directory.
pub struct OutputCollector {
    dir: PathBuf,
    inputs: Snapshot,
    drains: Vec<Drain>,
    drain_timeout: Duration,
}

impl OutputCollector {
    /// Record the job's input files so tool output can be told apart later.
    pub async fn prepare(job: &Job, drain_timeout: Duration) -> Result<Self, StagingError> {
        let dir = job.working_directory.clone();
        let scan_dir = dir.clone();
        let inputs = tokio::task::spawn_blocking(move || snapshot(&scan_dir))
            .await
            .map_err(|e| StagingError::Read {
                path: dir.clone(),
                source: io::Error::other(e),
            })??;

        Ok(Self {
            dir,
            inputs,
            drains: Vec::new(),
            drain_timeout,
        })
    }

    /// Start draining the process's stdout and stderr.
    pub async fn attach(&mut self, handle: &mut ProcessHandle) -> Result<(), StagingError> {
        let (stdout, stderr) = handle.take_pipes();
        if let Some(pipe) = stdout {
            self.spawn_drain(STDOUT_FILE, pipe).await?;
        }
        if let Some(pipe) = stderr {
            self.spawn_drain(STDERR_FILE, pipe).await?;
        }
        Ok(())
    }

    async fn spawn_drain<R>(&mut self, name: &str, mut pipe: R) -> Result<(), StagingError>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let path = self.dir.join(name);
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|source| StagingError::Write {
                path: path.clone(),
                source,
            })?;

        let handle = tokio::spawn(async move {
            let bytes = tokio::io::copy(&mut pipe, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(bytes)
        });
        self.drains.push(Drain { path, handle });
        Ok(())
    }

    /// Stage the bundle for a process that ended with `outcome`.
    pub async fn finalize(self, job: &mut Job, outcome: Outcome) -> Result<StagedBundle, StagingError> {
        self.finish(job, Some(outcome), None).await
    }

    /// Stage the bundle for a process the supervisor lost track of.
    pub async fn finalize_lost(self, job: &mut Job, error: String) -> Result<StagedBundle, StagingError> {
        self.finish(job, None, Some(error)).await
    }

    async fn finish(
        mut self,
        job: &mut Job,
        outcome: Option<Outcome>,
        error: Option<String>,
    ) -> Result<StagedBundle, StagingError> {
        let output_complete = self.drain_all(job).await?;

        let dir = self.dir.clone();
        let expected = job.expected_outputs.clone();
        let inputs = std::mem::take(&mut self.inputs);
        let (artifacts, missing) = tokio::task::spawn_blocking(move || {
            inventory(&dir, &expected, &inputs)
        })
        .await
        .map_err(|e| StagingError::Read {
            path: self.dir.clone(),
            source: io::Error::other(e),
        })??;

        let (state, reason) = match (outcome, error) {
            (_, Some(error)) => (JobState::Failed, Some(error)),
            (Some(outcome), None) => classify(outcome, &missing),
            (None, None) => (JobState::Failed, None),
        };
        job.transition_to(state, reason.clone())?;

        stage(job, outcome, artifacts, missing, reason, output_complete).await
    }

    /// Wait for both drains; false when one had to be abandoned.
    async fn drain_all(&mut self, job: &Job) -> Result<bool, StagingError> {
        let mut complete = true;
        for mut drain in self.drains.drain(..) {
            match tokio::time::timeout(self.drain_timeout, &mut drain.handle).await {
                Ok(Ok(Ok(bytes))) => {
                    debug!(job_id = %job.id, file = %drain.path.display(), bytes, "Capture drained");
                }
                Ok(Ok(Err(source))) => {
                    return Err(StagingError::Write {
                        path: drain.path,
                        source,
                    });
                }
                Ok(Err(e)) => {
                    warn!(job_id = %job.id, error = %e, "Capture task failed");
                    complete = false;
                }
                Err(_) => {
                    drain.handle.abort();
                    warn!(
                        job_id = %job.id,
                        file = %drain.path.display(),
                        "Capture pipe still open after the tool exited, abandoning"
                    );
                    complete = false;
                }
            }
        }
        Ok(complete)
    }

    /// Stage a bundle for a job whose tool never ran. No artifacts are captured.
    pub async fn stage_failure(job: &mut Job, reason: String) -> Result<StagedBundle, StagingError> {
        job.transition_to(JobState::Failed, Some(reason.clone()))?;
        stage(job, None, Vec::new(), Vec::new(), Some(reason), true).await
    }

    /// Stage a bundle for a job aborted before its tool was started.
    pub async fn stage_cancelled(job: &mut Job, reason: String) -> Result<StagedBundle, StagingError> {
        job.transition_to(JobState::Cancelled, Some(reason.clone()))?;
        stage(job, Some(Outcome::Cancelled), Vec::new(), Vec::new(), Some(reason), true).await
    }
}

/// Final classification of a finished process.
fn classify(outcome: Outcome, missing: &[String]) -> (JobState, Option<String>) {
    match outcome {
        Outcome::Exited { code: 0 } if missing.is_empty() => (JobState::Completed, None),
        Outcome::Exited { code: 0 } => (
            JobState::Failed,
            Some(format!("missing expected outputs: {}", missing.join(", "))),
        ),
        Outcome::Exited { .. } | Outcome::Signaled { .. } => {
            (JobState::Failed, Some(outcome.to_string()))
        }
        Outcome::TimedOut => (JobState::TimedOut, Some(outcome.to_string())),
        Outcome::Cancelled => (JobState::Cancelled, Some(outcome.to_string())),
    }
}

/// Write `.done` and `bundle.json` for a job in its terminal state.
async fn stage(
    job: &Job,
    outcome: Option<Outcome>,
    artifacts: Vec<Artifact>,
    missing_outputs: Vec<String>,
    error: Option<String>,
    output_complete: bool,
) -> Result<StagedBundle, StagingError> {
    let dir = &job.working_directory;
    let exit_status = status_code(outcome);

    match tokio::fs::remove_file(dir.join(READY_FILE)).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(job_id = %job.id, error = %e, "Failed to remove {READY_FILE}"),
    }

    write_synced(&dir.join(DONE_FILE), format!("{exit_status}\n").as_bytes()).await?;

    let manifest = BundleManifest {
        job_id: job.id.clone(),
        state: job.state,
        outcome,
        exit_status,
        started_at: job.started_at,
        ended_at: job.ended_at,
        artifacts,
        missing_outputs,
        error,
        output_complete,
        transitions: job.transitions.clone(),
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
    };

    // The manifest marks the bundle as finalized, so it must never be partial.
    let temp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    write_synced(&temp, &serde_json::to_vec_pretty(&manifest)?).await?;
    let target = dir.join(MANIFEST_FILE);
    tokio::fs::rename(&temp, &target)
        .await
        .map_err(|source| StagingError::Write {
            path: target,
            source,
        })?;

    info!(
        job_id = %job.id,
        state = %job.state,
        exit_status,
        artifacts = manifest.artifacts.len(),
        "Staged bundle"
    );

    Ok(StagedBundle {
        job_id: job.id.clone(),
        path: dir.clone(),
        manifest,
    })
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), StagingError> {
    let write = async {
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await
    };
    write.await.map_err(|source| StagingError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn snapshot(dir: &Path) -> Result<Snapshot, StagingError> {
    let read_err = |source| StagingError::Read {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = HashMap::new();
    for rel in fsutil::list_files(dir).map_err(read_err)? {
        let meta = std::fs::metadata(dir.join(&rel)).map_err(read_err)?;
        files.insert(rel, (meta.len(), meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
    }
    Ok(files)
}

/// Collect artifacts in bundle order: stdout, stderr, declared, produced.
fn inventory(
    dir: &Path,
    expected: &[PathBuf],
    inputs: &Snapshot,
) -> Result<(Vec<Artifact>, Vec<String>), StagingError> {
    let mut artifacts = Vec::new();
    let mut missing = Vec::new();

    for (name, kind) in [(STDOUT_FILE, ArtifactKind::Stdout), (STDERR_FILE, ArtifactKind::Stderr)] {
        if dir.join(name).is_file() {
            artifacts.push(artifact(dir, Path::new(name), kind)?);
        }
    }

    for rel in expected {
        if dir.join(rel).is_file() {
            artifacts.push(artifact(dir, rel, ArtifactKind::Declared)?);
        } else {
            missing.push(rel.display().to_string());
        }
    }

    let files = fsutil::list_files(dir).map_err(|source| StagingError::Read {
        path: dir.to_path_buf(),
        source,
    })?;
    for rel in files {
        let reserved = rel.parent() == Some(Path::new(""))
            && rel
                .to_str()
                .is_some_and(|name| RESERVED_FILES.contains(&name) || name.starts_with(MANIFEST_FILE));
        if reserved || expected.contains(&rel) {
            continue;
        }
        let meta = std::fs::metadata(dir.join(&rel)).map_err(|source| StagingError::Read {
            path: dir.join(&rel),
            source,
        })?;
        let unchanged = inputs.get(&rel).is_some_and(|(len, mtime)| {
            *len == meta.len() && Some(*mtime) == meta.modified().ok()
        });
        if !unchanged {
            artifacts.push(artifact(dir, &rel, ArtifactKind::Produced)?);
        }
    }

    Ok((artifacts, missing))
}

fn artifact(dir: &Path, rel: &Path, kind: ArtifactKind) -> Result<Artifact, StagingError> {
    let path = dir.join(rel);
    let read_err = |source| StagingError::Read {
        path: path.clone(),
        source,
    };
    let mut file = std::fs::File::open(&path).map_err(read_err)?;
    let mut hasher = Sha256::new();
    let size = io::copy(&mut file, &mut hasher).map_err(read_err)?;
    Ok(Artifact {
        path: rel.display().to_string(),
        kind,
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}
