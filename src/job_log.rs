use crate::schema::LogLevel;
use crate::storage;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::warn;

/// Handle for appending to a job's log stream.
///
/// Owned by whichever worker currently holds the job's lease and handed to the
/// task body for progress reporting. Appends are fire-and-forget: a failed
/// insert is reported through `tracing` and otherwise ignored, because log
/// writes must never abort the job.
#[derive(Clone)]
pub struct JobLogger {
    pool: SqlitePool,
    job_id: i64,
}

impl JobLogger {
    pub(crate) fn new(pool: SqlitePool, job_id: i64) -> Self {
        Self { pool, job_id }
    }

    /// Append an `info` entry. `msg` should be a short machine-readable code.
    pub async fn info(&self, msg: &str) {
        self.append(LogLevel::Info, msg, None).await;
    }

    /// Append an `info` entry with a structured payload.
    pub async fn info_with(&self, msg: &str, data: Value) {
        self.append(LogLevel::Info, msg, Some(data)).await;
    }

    /// Append an `error` entry.
    pub async fn error(&self, msg: &str) {
        self.append(LogLevel::Error, msg, None).await;
    }

    /// Append an `error` entry with a structured payload.
    pub async fn error_with(&self, msg: &str, data: Value) {
        self.append(LogLevel::Error, msg, Some(data)).await;
    }

    async fn append(&self, level: LogLevel, msg: &str, data: Option<Value>) {
        if let Err(error) = storage::append_log(&self.pool, self.job_id, level, msg, data).await {
            warn!(job.id = self.job_id, %error, "Failed to append job log entry");
        }
    }
}
