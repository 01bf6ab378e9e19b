//! Process supervision for one scan tool invocation.
//!
//! The tool runs in its own process group so that termination reaches every
//! process it forked:
//! - timeout or cancellation: SIGTERM to the group, grace period, SIGKILL
//! - natural exit: leftover group members are killed so none keeps the
//!   capture pipes open
//!
//! Exit detection races the deadline and the cancellation token. An exit
//! observed at or after the deadline is classified `TimedOut`.

use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SpawnError;
use crate::job::{Job, JobId, JobState};

/// Spawn attempts when the executable is still open for writing (ETXTBSY).
const SPAWN_ATTEMPTS: u32 = 5;

/// Stand-in deadline when `now + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Exited on its own with a status code.
    Exited { code: i32 },
    /// Killed by a signal it did not get from us.
    Signaled { signal: i32 },
    /// Ran past its deadline and was terminated.
    TimedOut,
    /// Terminated because of shutdown or an abort request.
    Cancelled,
}

impl Outcome {
    /// Classify an OS exit status.
    pub fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited { code },
            (None, Some(signal)) => Self::Signaled { signal },
            (None, None) => Self::Exited { code: -1 },
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Exit observed at `observed_at` counts only if strictly before `deadline`.
pub fn classify_exit(observed_at: Instant, deadline: Instant, status: ExitStatus) -> Outcome {
    if observed_at >= deadline {
        Outcome::TimedOut
    } else {
        Outcome::from_status(status)
    }
}

/// Deadline `timeout` from `now`, clamped when the sum overflows.
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// A running tool process.
#[derive(Debug)]
pub struct ProcessHandle {
    job_id: JobId,
    child: Child,
    pid: i32,
    deadline: Instant,
    settled: bool,
}

impl ProcessHandle {
    /// Hand the capture pipes to the collector.
    pub fn take_pipes(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // A handle dropped before `wait` settled (task aborted) must not
        // leave its process group behind.
        if !self.settled {
            signal_group(self.pid, Signal::SIGKILL);
        }
    }
}

/// Launches and supervises scan tool processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    grace_period: Duration,
}

impl ProcessSupervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    /// Spawn the job's tool in its working directory and mark it running.
    pub async fn start(&self, job: &mut Job, timeout: Duration) -> Result<ProcessHandle, SpawnError> {
        if job.state != JobState::Pending {
            return Err(SpawnError::NotPending {
                id: job.id.clone(),
                state: job.state.to_string(),
            });
        }

        let invocation = job.invocation.clone();
        if invocation.is_default_job_file {
            make_executable(&invocation.program).await?;
        }

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .current_dir(&job.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = spawn_with_retry(&mut command, &invocation.program).await?;
        let Some(pid) = child.id() else {
            return Err(SpawnError::Io {
                program: invocation.program,
                source: std::io::Error::other("child exited before its pid was read"),
            });
        };
        let pid = pid as i32;
        let deadline = deadline_after(Instant::now(), timeout);

        job.transition_to(JobState::Running, Some(format!("pid {pid}")))
            .map_err(|_| SpawnError::NotPending {
                id: job.id.clone(),
                state: job.state.to_string(),
            })?;

        info!(
            job_id = %job.id,
            pid,
            program = %invocation.program.display(),
            timeout_secs = timeout.as_secs(),
            "Starting work"
        );

        Ok(ProcessHandle {
            job_id: job.id.clone(),
            child,
            pid,
            deadline,
            settled: false,
        })
    }

    /// Wait for exit, deadline or cancellation, terminating the tool when
    /// it did not exit on its own.
    pub async fn wait(
        &self,
        handle: &mut ProcessHandle,
        cancel: &CancellationToken,
    ) -> std::io::Result<Outcome> {
        let deadline = handle.deadline;
        let waited = tokio::select! {
            biased;
            status = handle.child.wait() => {
                status.map(|status| classify_exit(Instant::now(), deadline, status))
            }
            _ = tokio::time::sleep_until(deadline) => Ok(Outcome::TimedOut),
            _ = cancel.cancelled() => Ok(Outcome::Cancelled),
        };

        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %handle.job_id, error = %e, "Lost track of tool process");
                self.terminate(handle).await;
                return Err(e);
            }
        };

        match outcome {
            Outcome::TimedOut | Outcome::Cancelled => {
                info!(job_id = %handle.job_id, pid = handle.pid, %outcome, "Terminating tool");
                self.terminate(handle).await;
            }
            Outcome::Exited { .. } | Outcome::Signaled { .. } => {
                if signal_group(handle.pid, Signal::SIGKILL) {
                    debug!(job_id = %handle.job_id, "Killed leftover processes in job group");
                }
                handle.settled = true;
            }
        }

        info!(job_id = %handle.job_id, %outcome, "Process finished");
        Ok(outcome)
    }

    /// SIGTERM the group, give it the grace period, then SIGKILL and reap.
    async fn terminate(&self, handle: &mut ProcessHandle) {
        signal_group(handle.pid, Signal::SIGTERM);

        match tokio::time::timeout(self.grace_period, handle.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(job_id = %handle.job_id, ?status, "Tool exited after SIGTERM");
            }
            Ok(Err(e)) => {
                warn!(job_id = %handle.job_id, error = %e, "Failed waiting for tool after SIGTERM");
            }
            Err(_) => {
                warn!(
                    job_id = %handle.job_id,
                    grace_secs = self.grace_period.as_secs_f64(),
                    "Tool ignored SIGTERM, killing"
                );
            }
        }

        signal_group(handle.pid, Signal::SIGKILL);
        if let Err(e) = handle.child.wait().await {
            warn!(job_id = %handle.job_id, error = %e, "Failed to reap tool process");
        }
        handle.settled = true;
    }
}

/// Signal a process group. Returns false when the group no longer exists.
fn signal_group(pgid: i32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// The commander writes `job` without the execute bit.
async fn make_executable(program: &Path) -> Result<(), SpawnError> {
    let metadata = match tokio::fs::metadata(program).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnError::NotFound {
                program: program.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(SpawnError::Io {
                program: program.to_path_buf(),
                source,
            });
        }
    };

    let mut permissions = metadata.permissions();
    if permissions.mode() & 0o777 != 0o755 {
        permissions.set_mode(0o755);
        if let Err(e) = tokio::fs::set_permissions(program, permissions).await {
            warn!(program = %program.display(), error = %e, "Failed to mark job executable");
        }
    }
    Ok(())
}

async fn spawn_with_retry(command: &mut Command, program: &Path) -> Result<Child, SpawnError> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(e) if e.kind() == std::io::ErrorKind::ExecutableFileBusy && attempt < SPAWN_ATTEMPTS => {
                debug!(program = %program.display(), attempt, "Executable busy, retrying spawn");
                tokio::time::sleep(Duration::from_millis(20 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(match e.kind() {
                    std::io::ErrorKind::NotFound => SpawnError::NotFound {
                        program: program.to_path_buf(),
                    },
                    std::io::ErrorKind::PermissionDenied => SpawnError::NotPermitted {
                        program: program.to_path_buf(),
                    },
                    _ => SpawnError::Io {
                        program: program.to_path_buf(),
                        source: e,
                    },
                });
            }
        }
    }
}
