use crate::errors::EnqueueError;
use crate::job_log::JobLogger;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::SqlitePool;
use std::future::Future;
use tracing::instrument;

/// Trait for defining job task bodies that can be enqueued and executed by
/// workers holding a lease.
///
/// Implementations must be safe to re-run: after a lease expires the job is
/// reclaimed by another worker while the original process may still be
/// executing, so in the worst case the body runs twice concurrently.
pub trait JobHandler: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique type tag of the job.
    ///
    /// This MUST be unique for the whole application; it selects the handler
    /// a worker dispatches the payload to.
    const JOB_TYPE: &'static str;

    /// Ceiling on lease acquisitions before a failing job becomes terminally
    /// `failed`. Fixed at enqueue time.
    const MAX_ATTEMPTS: i32 = 3;

    /// Whether the job should be deduplicated.
    ///
    /// If true, the job will not be enqueued if there is already a queued
    /// job with the same payload.
    const DEDUPLICATED: bool = false;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task body. Runs under a held lease.
    ///
    /// `log` appends to the job's log stream; entries are fire-and-forget.
    /// The returned [`JobOutput`] becomes the job's result record; the worker
    /// writes it immediately before the success transition. Failure is
    /// communicated by returning an error; whether that retries or
    /// terminally fails the job is the worker's decision, not the body's.
    fn run(
        &self,
        ctx: Self::Context,
        log: JobLogger,
    ) -> impl Future<Output = anyhow::Result<JobOutput>> + Send;

    /// Enqueue this job for execution.
    ///
    /// Returns the job ID if successfully enqueued, or `None` if deduplicated.
    #[instrument(name = "joblease.enqueue", skip(self, pool), fields(message = Self::JOB_TYPE))]
    fn enqueue<'a>(&'a self, pool: &'a SqlitePool) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
        let payload = match serde_json::to_value(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };
        let max_attempts = Self::MAX_ATTEMPTS;

        if Self::DEDUPLICATED {
            let future = enqueue_deduplicated(pool, Self::JOB_TYPE, payload, max_attempts);
            future.boxed()
        } else {
            let future = enqueue_simple(pool, Self::JOB_TYPE, payload, max_attempts);
            async move { Ok(Some(future.await?)) }.boxed()
        }
    }
}

/// What a successful task body hands back to the worker; becomes the job's
/// result record.
#[derive(Debug, Clone)]
pub struct JobOutput {
    /// Human-readable summary of the outcome.
    pub summary: String,
    /// Optional structured payload for machine consumers.
    pub data: Option<Value>,
}

impl JobOutput {
    /// A result with just a summary line.
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            data: None,
        }
    }

    /// Attach a structured payload to the result.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

fn enqueue_deduplicated<'a>(
    pool: &'a SqlitePool,
    job_type: &'a str,
    payload: Value,
    max_attempts: i32,
) -> BoxFuture<'a, Result<Option<i64>, EnqueueError>> {
    async move {
        // Insert only if no identical job is still waiting; a running copy of
        // the same job does not block a new enqueue.
        let result = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO jobs (job_type, payload, status, attempts, max_attempts, created_at, updated_at)
            SELECT $1, $2, 'queued', 0, $3, $4, $4
            WHERE NOT EXISTS (
                SELECT 1 FROM jobs
                WHERE job_type = $1 AND payload = $2 AND status = 'queued'
            )
            RETURNING id
            ",
        )
        .bind(job_type)
        .bind(payload)
        .bind(max_attempts)
        .bind(chrono::Utc::now())
        .fetch_optional(pool)
        .await?;

        Ok(result)
    }
    .boxed()
}

fn enqueue_simple<'a>(
    pool: &'a SqlitePool,
    job_type: &'a str,
    payload: Value,
    max_attempts: i32,
) -> BoxFuture<'a, Result<i64, EnqueueError>> {
    async move {
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO jobs (job_type, payload, status, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, 'queued', 0, $3, $4, $4)
            RETURNING id
            ",
        )
        .bind(job_type)
        .bind(payload)
        .bind(max_attempts)
        .bind(chrono::Utc::now())
        .fetch_one(pool)
        .await?;

        Ok(id)
    }
    .boxed()
}
