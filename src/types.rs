/// Core entities for the sbx system: jobs, limits, run results and errors.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Terminal and non-terminal job states.
///
/// QUEUED -> RUNNING -> {FINISHED, FAILED, TIMEOUT, KILLED}.
/// Terminal states are sinks; a re-run re-enters RUNNING from any of them.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FINISHED")]
    Finished,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "KILLED")]
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Timeout => "TIMEOUT",
            JobStatus::Killed => "KILLED",
        }
    }
}

/// A submitted job. Owned by the orchestrator for its lifetime; the
/// execution engine only borrows it during a run.
///
/// `workspace` and `script_path` are only meaningful once the job has
/// left QUEUED (the workspace is created at submission, the paths are
/// re-resolved at run time).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub lang: String,
    pub entry: String,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub workspace: PathBuf,
    #[serde(skip)]
    pub script_path: PathBuf,
}

/// Immutable resource limits for one run attempt. Resolved once from
/// configuration, never mutated afterwards.
///
/// `wall_timeout_seconds` is the outer clock enforced by the engine,
/// independent of (and normally >=) the in-process `cpu_seconds` rlimit.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Limits {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub nofile: u64,
    pub wall_timeout_seconds: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_seconds: 2,
            memory_bytes: 128 * 1024 * 1024,
            nofile: 64,
            wall_timeout_seconds: 5,
        }
    }
}

/// Outcome of exactly one run attempt. Immutable after construction;
/// becomes the source of truth for the job's terminal state and the
/// persisted artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub status: JobStatus,
    /// Process return code. Negative values are signal sentinels
    /// (-9 for the SIGKILL timeout path).
    pub rc: i32,
    pub reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub duration_s: f64,
}

impl RunResult {
    /// Internal launch failure, classified FAILED with a machine-parseable reason.
    pub fn runner_error(detail: impl std::fmt::Display, duration_s: f64) -> Self {
        Self {
            status: JobStatus::Failed,
            rc: -1,
            reason: Some(format!("runner_error:{detail}")),
            stdout: String::new(),
            stderr: detail.to_string(),
            duration_s,
        }
    }
}

/// Error taxonomy. Validation errors surface to the caller before any
/// isolation work; environment errors abort run preparation; everything
/// that would weaken containment is escalated, never retried silently.
#[derive(Error, Debug)]
pub enum SbxError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("environment error: {0}")]
    Environment(String),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("seccomp error: {0}")]
    Seccomp(String),

    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for SbxError {
    fn from(err: nix::errno::Errno) -> Self {
        SbxError::Process(err.to_string())
    }
}

/// Result type alias for sbx operations.
pub type Result<T> = std::result::Result<T, SbxError>;
