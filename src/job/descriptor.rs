//! Optional `job.json` descriptor deposited next to the job executable.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::MAX_TIMEOUT;

/// Executable the commander writes into every job directory.
pub const DEFAULT_JOB_FILE: &str = "job";

/// Descriptor file name inside a job directory.
pub const DESCRIPTOR_FILE: &str = "job.json";

/// Job metadata supplied by the commander. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    /// Program to run instead of `./job`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides the configured per-job timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Paths, relative to the job directory, the tool must produce.
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

impl JobDescriptor {
    /// Parse descriptor JSON and reject paths that leave the job directory.
    ///
    /// Timeouts above [`MAX_TIMEOUT`] are clamped. Output paths are
    /// normalized (`./a/b` becomes `a/b`) and deduplicated.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut descriptor: Self = serde_json::from_str(raw).map_err(|e| e.to_string())?;
        match descriptor.timeout_secs {
            Some(0) => return Err("timeout_secs must be greater than zero".to_string()),
            Some(secs) => descriptor.timeout_secs = Some(secs.min(MAX_TIMEOUT.as_secs())),
            None => {}
        }

        let mut outputs: Vec<String> = Vec::with_capacity(descriptor.expected_outputs.len());
        for output in &descriptor.expected_outputs {
            let Some(normalized) = normalize_output(output) else {
                return Err(format!("expected output {output:?} is not a relative path"));
            };
            if !outputs.contains(&normalized) {
                outputs.push(normalized);
            }
        }
        descriptor.expected_outputs = outputs;
        Ok(descriptor)
    }

    /// Resolve the program and arguments against the job directory.
    pub fn invocation(&self, working_directory: &Path) -> Invocation {
        let program = match self.command.as_deref() {
            None => working_directory.join(DEFAULT_JOB_FILE),
            Some(cmd) => {
                let path = Path::new(cmd);
                if path.is_relative() && cmd.contains('/') {
                    working_directory.join(path)
                } else {
                    PathBuf::from(cmd)
                }
            }
        };
        Invocation {
            program,
            args: self.args.clone(),
            is_default_job_file: self.command.is_none(),
        }
    }
}

/// Relative path with `.` components dropped, or `None` if it escapes.
fn normalize_output(output: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(output).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Resolved tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// The program is the commander-written `job` file, which gets chmod 0755.
    pub is_default_job_file: bool,
}
