//! Job state machine.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::descriptor::{Invocation, JobDescriptor};
use super::id::JobId;
use crate::error::JobError;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Claimed, tool not started yet.
    Pending,
    /// Tool process is running.
    Running,
    /// Tool exited 0 and produced every declared output.
    Completed,
    /// Tool failed, crashed, could not start, or left outputs missing.
    Failed,
    /// Tool exceeded its time budget and was terminated.
    TimedOut,
    /// Tool was terminated by shutdown or an abort request.
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled) |
            // From Running
            (Running, Running) | (Running, Completed) | (Running, Failed) |
            (Running, TimedOut) | (Running, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobState,
    pub to: JobState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One unit of requested scan work, owned by the slot running it.
#[derive(Debug, Clone)]
pub struct Job {
    /// Orchestrator-supplied id, also the directory name.
    pub id: JobId,
    /// Directory the tool runs in.
    pub working_directory: PathBuf,
    /// Resolved tool invocation.
    pub invocation: Invocation,
    /// Per-job timeout override from the descriptor.
    pub timeout: Option<Duration>,
    /// Files the tool is expected to leave in its working directory.
    pub expected_outputs: Vec<PathBuf>,
    /// Descriptor problem found at claim time; the job fails without running.
    pub descriptor_error: Option<String>,
    pub state: JobState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl Job {
    /// Build a pending job from its claimed directory and descriptor.
    pub fn new(id: JobId, working_directory: PathBuf, descriptor: JobDescriptor) -> Self {
        let invocation = descriptor.invocation(&working_directory);
        Self {
            id,
            working_directory,
            invocation,
            timeout: descriptor.timeout_secs.map(Duration::from_secs),
            expected_outputs: descriptor.expected_outputs.into_iter().map(PathBuf::from).collect(),
            descriptor_error: None,
            state: JobState::Pending,
            started_at: None,
            ended_at: None,
            transitions: Vec::new(),
        }
    }

    /// Build a pending job whose descriptor could not be loaded.
    pub fn with_descriptor_error(id: JobId, working_directory: PathBuf, error: String) -> Self {
        let mut job = Self::new(id, working_directory, JobDescriptor::default());
        job.descriptor_error = Some(error);
        job
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: JobState,
        reason: Option<String>,
    ) -> Result<(), JobError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                state: self.state.to_string(),
                target: new_state.to_string(),
            });
        }
        if self.state == new_state {
            return Ok(());
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
            reason,
        });
        self.state = new_state;

        match new_state {
            JobState::Running => self.started_at = Some(now),
            s if s.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }

        Ok(())
    }
}
