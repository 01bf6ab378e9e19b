//! Error types for the scan runner.

use std::path::PathBuf;

use crate::job::JobId;

/// Top-level error type for the runner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Claim failed: {0}")]
    Claim(#[from] ClaimFailed),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Directory {path} is not usable: {reason}")]
    BadDirectory { path: PathBuf, reason: String },
}

/// Instance lock errors.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Another runner already holds {path}")]
    AlreadyLocked { path: PathBuf },

    #[error("Failed to lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors scanning or reading the job namespaces.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid job id: {0:?}")]
    InvalidId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A claim lost the race or targeted a job that is not claimable.
#[derive(Debug, thiserror::Error)]
pub enum ClaimFailed {
    #[error("Job {id} is no longer pending")]
    Vanished { id: JobId },

    #[error("Job {id} is already staged")]
    AlreadyStaged { id: JobId },

    #[error("Job {id} could not be claimed: {source}")]
    Io {
        id: JobId,
        #[source]
        source: std::io::Error,
    },
}

/// The scan tool could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Executable {program} not found")]
    NotFound { program: PathBuf },

    #[error("Executable {program} is not permitted to run")]
    NotPermitted { program: PathBuf },

    #[error("Failed to spawn {program}: {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {id} is {state}, only pending jobs can start")]
    NotPending { id: JobId, state: String },
}

/// Assembling the staged bundle failed.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to inspect {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

impl StagingError {
    /// Disk-full style failures take the whole daemon down.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::Write { source, .. } | Self::Read { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
            ),
            _ => false,
        }
    }
}

/// Publication of a staged bundle failed. The bundle stays in staging.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Bundle for job {id} already exists at {destination}")]
    AlreadyExists { id: JobId, destination: PathBuf },

    #[error("Staged bundle for job {id} is missing from {path}")]
    MissingStaged { id: JobId, path: PathBuf },

    #[error("Failed to publish job {id}: {source}")]
    Io {
        id: JobId,
        #[source]
        source: std::io::Error,
    },
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} in state {state} cannot transition to {target}")]
    InvalidTransition {
        id: JobId,
        state: String,
        target: String,
    },

    #[error("Job {id} is already held by slot {slot}")]
    AlreadyInFlight { id: JobId, slot: usize },

    #[error("Slot {slot} is occupied")]
    SlotOccupied { slot: usize },

    #[error("Job {id} task failed: {reason}")]
    TaskFailed { id: JobId, reason: String },
}

/// Result type alias for the runner.
pub type Result<T> = std::result::Result<T, Error>;
