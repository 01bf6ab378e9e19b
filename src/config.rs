//! Configuration types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Commander drops new job directories here.
pub const PENDING_DIR: &str = "running";
/// Claimed jobs run and are assembled here, invisible to the commander.
pub const STAGING_DIR: &str = ".staging";
/// Published bundles land here.
pub const DONE_DIR: &str = "done";

/// Upper bound for every configured duration, and for descriptor timeouts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Pending job namespace.
    pub pending_dir: PathBuf,
    /// Staging area (claimed and in-flight jobs).
    pub staging_dir: PathBuf,
    /// Published bundle namespace.
    pub done_dir: PathBuf,
    /// Delay between pending-job scans.
    pub poll_interval: Duration,
    /// Number of runner slots (jobs in flight at once).
    pub slots: usize,
    /// Default per-job timeout; a descriptor may override it.
    pub job_timeout: Duration,
    /// Time between SIGTERM and SIGKILL when terminating a tool.
    pub grace_period: Duration,
    /// How long to wait for capture pipes to close after the tool is gone.
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::for_root(Path::new("."))
    }
}

impl RunnerConfig {
    /// Standard layout under a single working directory.
    pub fn for_root(root: &Path) -> Self {
        Self {
            pending_dir: root.join(PENDING_DIR),
            staging_dir: root.join(STAGING_DIR),
            done_dir: root.join(DONE_DIR),
            poll_interval: Duration::from_secs(15),
            slots: 4,
            job_timeout: Duration::from_secs(24 * 60 * 60),
            grace_period: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Reject values the runner cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(invalid("slots", "must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(invalid("poll_interval", "must be greater than zero"));
        }
        if self.job_timeout.is_zero() {
            return Err(invalid("job_timeout", "must be greater than zero"));
        }
        for (key, value) in [
            ("poll_interval", self.poll_interval),
            ("job_timeout", self.job_timeout),
            ("grace_period", self.grace_period),
            ("drain_timeout", self.drain_timeout),
        ] {
            if value > MAX_TIMEOUT {
                return Err(invalid(key, "must not exceed one year"));
            }
        }
        let dirs = [&self.pending_dir, &self.staging_dir, &self.done_dir];
        for (i, a) in dirs.iter().enumerate() {
            for b in &dirs[i + 1..] {
                if a == b {
                    return Err(ConfigError::BadDirectory {
                        path: a.to_path_buf(),
                        reason: "pending, staging and done directories must differ".into(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Create the three namespaces if missing.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        for dir in [&self.pending_dir, &self.staging_dir, &self.done_dir] {
            if !dir.exists() {
                tracing::info!(dir = %dir.display(), "Creating directory");
            }
            std::fs::create_dir_all(dir).map_err(|e| ConfigError::BadDirectory {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// Log output configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log to stdout instead of the rotating file.
    pub stdout: bool,
    /// Directory holding rotated log files.
    pub directory: PathBuf,
    /// Log file name prefix.
    pub file_prefix: String,
    /// Rotated files kept on disk.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            stdout: false,
            directory: PathBuf::from("/var/log/scan-runner"),
            file_prefix: "runner".to_string(),
            max_files: 10,
        }
    }
}
