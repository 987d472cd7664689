//! Database schema definitions for SQLx.
//!
//! This module contains the row types for the three tables owned by the core:
//! `jobs`, `job_logs` and `job_results`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;

/// Lifecycle status of a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a worker; the initial state, and the state a job returns to
    /// on retry.
    Queued,
    /// Currently leased by a worker. A `running` job whose lease has expired is
    /// eligible for reclaim.
    Running,
    /// Terminal: the task body completed and a result was recorded.
    Succeeded,
    /// Terminal: the task body failed on its final permitted attempt.
    Failed,
    /// Terminal: an external actor cancelled the job.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions are permitted from this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Severity of a [`JobLogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
pub enum LogLevel {
    /// Progress events.
    Info,
    /// Failures, including per-attempt task-body errors.
    Error,
}

/// Represents a job record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job.
    pub id: i64,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// JSON payload handed to the task body; opaque to the core.
    pub payload: Value,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Number of lease acquisitions so far. Also serves as the lease epoch:
    /// holder-side writes carry the value observed at claim time, so writes
    /// from a holder whose lease was reclaimed affect zero rows.
    pub attempts: i32,
    /// Ceiling on `attempts`; reaching it on failure is terminal.
    pub max_attempts: i32,
    /// When the current lease expires; `None` while unleased.
    pub lease_until: Option<DateTime<Utc>>,
    /// Timestamp of the first lease grant.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp of the terminal transition.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last failure message; populated only on terminal failure or cancel.
    pub error: Option<String>,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

/// Represents an append-only log entry emitted while a job runs.
#[derive(Debug, Clone, FromRow)]
pub struct JobLogEntry {
    /// Monotonic store-assigned id; orders entries within a job.
    pub id: i64,
    /// The owning job.
    pub job_id: i64,
    /// When the entry was written.
    pub ts: DateTime<Utc>,
    /// Entry severity.
    pub level: LogLevel,
    /// Short machine-readable event code, not free text.
    pub msg: String,
    /// Optional structured payload.
    pub data: Option<Value>,
}

/// Represents a result record written by a successful run.
///
/// History may accumulate across reclaims; the row with the highest `id` per
/// job is the authoritative result.
#[derive(Debug, Clone, FromRow)]
pub struct JobResult {
    /// Monotonic store-assigned id.
    pub id: i64,
    /// The owning job.
    pub job_id: i64,
    /// Human-readable summary of the outcome.
    pub summary: String,
    /// Optional structured payload.
    pub data: Option<Value>,
    /// When the result was written.
    pub created_at: DateTime<Utc>,
}
