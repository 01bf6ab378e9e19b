//! Result bundles: the staged, then published, output of one job.
//!
//! A bundle is the job's directory plus:
//! - `job.out` / `job.err`: captured tool output
//! - `.done`: one integer line, the status code the commander reads
//! - `bundle.json`: the manifest ([`BundleManifest`])
//!
//! A bundle is assembled in the staging area and becomes visible in the done
//! directory through one rename ([`finalizer::BundleFinalizer`]).

pub mod finalizer;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobState, StateTransition};
use crate::worker::supervisor::Outcome;

pub use finalizer::{BundleFinalizer, PublishedBundle};

pub const MANIFEST_FILE: &str = "bundle.json";
pub const STDOUT_FILE: &str = "job.out";
pub const STDERR_FILE: &str = "job.err";

/// Status code for jobs whose tool never ran.
pub const NOT_STARTED_CODE: i32 = -111;
/// Status code for jobs terminated at their deadline.
pub const TIMED_OUT_CODE: i32 = -124;
/// Status code for jobs terminated by shutdown or abort.
pub const CANCELLED_CODE: i32 = -130;

/// Status code written to `.done` for an outcome.
pub fn status_code(outcome: Option<Outcome>) -> i32 {
    match outcome {
        Some(Outcome::Exited { code }) => code,
        Some(Outcome::Signaled { signal }) => -signal,
        Some(Outcome::TimedOut) => TIMED_OUT_CODE,
        Some(Outcome::Cancelled) => CANCELLED_CODE,
        None => NOT_STARTED_CODE,
    }
}

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Stdout,
    Stderr,
    /// Listed in the descriptor's `expected_outputs`.
    Declared,
    /// Written by the tool without being declared.
    Produced,
}

/// A captured file inside the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path relative to the bundle root.
    pub path: String,
    pub kind: ArtifactKind,
    pub size: u64,
    pub sha256: String,
}

/// Contents of `bundle.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleManifest {
    pub job_id: JobId,
    pub state: JobState,
    /// `None` when the tool never started.
    pub outcome: Option<Outcome>,
    pub exit_status: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<Artifact>,
    pub missing_outputs: Vec<String>,
    pub error: Option<String>,
    /// False when a capture pipe had to be abandoned.
    pub output_complete: bool,
    pub transitions: Vec<StateTransition>,
    pub runner_version: String,
}

impl BundleManifest {
    pub fn artifact(&self, path: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.path == path)
    }
}

/// A fully written bundle waiting in the staging area.
#[derive(Debug, Clone)]
pub struct StagedBundle {
    pub job_id: JobId,
    pub path: PathBuf,
    pub manifest: BundleManifest,
}

/// Read the manifest of a bundle directory, if it has been finalized.
pub async fn read_manifest(dir: &Path) -> std::io::Result<Option<BundleManifest>> {
    match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(std::io::Error::other),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
