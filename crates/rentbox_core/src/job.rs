use crate::language::Language;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A request to execute renter code, as submitted by the session service or the lender agent.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Unique per execution attempt. Generated when [`None`].
    #[serde(default)]
    pub job_id: Option<String>,
    /// Language name, e.g. `python` or `javascript`. Validated by the builder.
    pub language: String,
    /// The renter's program. Never logged.
    pub source_code: String,
    /// Packages to install before running, in the language's package manager syntax.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Wall-clock budget. [`None`] uses the deployment default.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl fmt::Debug for JobRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRequest")
            .field("job_id", &self.job_id)
            .field("language", &self.language)
            .field("source_code", &format_args!("<{} bytes>", self.source_code.len()))
            .field("dependencies", &self.dependencies)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Building,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Forward-only transitions; nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Failed)
                | (Building, Running)
                | (Building, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Building => "building",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Invalid job transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// A single execution attempt. Lives only as long as the coordinator is working on it.
pub struct Job {
    pub id: String,
    pub language: Language,
    pub dependencies: Vec<String>,
    pub timeout_ms: u64,
    source_code: String,
    status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        language: Language,
        source_code: impl Into<String>,
        dependencies: Vec<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            id: id.into(),
            language,
            dependencies,
            timeout_ms,
            source_code: source_code.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn source_code(&self) -> &str {
        &self.source_code
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("dependencies", &self.dependencies)
            .field("status", &self.status)
            .field("source_code", &format_args!("<{} bytes>", self.source_code.len()))
            .finish_non_exhaustive()
    }
}

/// Best-effort usage snapshot. Unavailable figures are 0, never absent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub gpu_utilization_percent: f64,
}

/// The result of a job, returned once all of its sandbox resources have been released.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub job_id: String,
    pub status: JobStatus,
    /// Combined stdout/stderr, truncated to the configured cap.
    pub output: String,
    /// Empty on success.
    pub error: String,
    pub resource_usage: ResourceUsage,
    pub execution_time_ms: u64,
    /// [`None`] if the process never exited on its own.
    #[serde(default)]
    pub exit_code: Option<i64>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}
