//! All SQL against the job store.
//!
//! Every mutation here is a single conditional statement (or one short
//! transaction), because the store's atomicity is the only serialization point
//! between concurrent workers and API callers. Holder-side writes carry the
//! lease epoch (`attempts` at claim time) so a worker whose lease was reclaimed
//! cannot overwrite the reclaimer's state.

use crate::job_handler::JobOutput;
use crate::schema::{Job, JobLogEntry, JobResult, JobStatus, LogLevel};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

const SETUP_STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_type TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL DEFAULT 3,
        lease_until TEXT,
        started_at TEXT,
        finished_at TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_jobs_eligible ON jobs (status, lease_until, created_at)",
    r"
    CREATE TABLE IF NOT EXISTS job_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs (id),
        ts TEXT NOT NULL,
        level TEXT NOT NULL,
        msg TEXT NOT NULL,
        data TEXT
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_job_logs_job ON job_logs (job_id, id)",
    r"
    CREATE TABLE IF NOT EXISTS job_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        job_id INTEGER NOT NULL REFERENCES jobs (id),
        summary TEXT NOT NULL,
        data TEXT,
        created_at TEXT NOT NULL
    )
    ",
    "CREATE INDEX IF NOT EXISTS idx_job_results_job ON job_results (job_id, id)",
];

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, \
     lease_until, started_at, finished_at, error, created_at, updated_at";

/// Open a connection pool on the shared job database file.
///
/// WAL mode plus a busy timeout lets several worker processes write to the
/// same file without spurious `SQLITE_BUSY` failures.
pub async fn connect(path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
}

/// Create the `jobs`, `job_logs` and `job_results` tables if they do not exist.
pub async fn setup_database(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SETUP_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn lease_deadline(now: DateTime<Utc>, lease_duration: Duration) -> DateTime<Utc> {
    let millis = i64::try_from(lease_duration.as_millis()).unwrap_or(i64::MAX);
    now + chrono::Duration::milliseconds(millis)
}

/// Atomically claim the next eligible job, granting a lease until
/// `now + lease_duration`.
///
/// A job is eligible when it is `queued`, or `running` with an expired lease
/// (a crashed or stalled worker; the job is reclaimed, not restarted from
/// scratch). Selection is FIFO by creation time. The single-statement
/// update-with-subquery is atomic in SQLite, so concurrent callers can never
/// both claim the same row.
pub async fn claim_next_job(
    pool: &SqlitePool,
    lease_duration: Duration,
) -> Result<Option<Job>, sqlx::Error> {
    let now = Utc::now();
    let lease_until = lease_deadline(now, lease_duration);

    sqlx::query_as::<_, Job>(&format!(
        r"
        UPDATE jobs
        SET status = 'running',
            attempts = attempts + 1,
            started_at = COALESCE(started_at, $1),
            lease_until = $2,
            updated_at = $1
        WHERE id = (
            SELECT id
            FROM jobs
            WHERE status = 'queued' OR (status = 'running' AND lease_until < $1)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
        )
        RETURNING {JOB_COLUMNS}
        ",
    ))
    .bind(now)
    .bind(lease_until)
    .fetch_optional(pool)
    .await
}

/// Push the lease deadline forward for a job still held under `lease_epoch`.
///
/// Returns `false` when the lease is no longer held (reclaimed, cancelled or
/// already terminal); the caller must stop heartbeating.
pub async fn extend_lease(
    pool: &SqlitePool,
    job_id: i64,
    lease_epoch: i32,
    lease_duration: Duration,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();
    let lease_until = lease_deadline(now, lease_duration);

    let result = sqlx::query(
        r"
        UPDATE jobs
        SET lease_until = $1, updated_at = $2
        WHERE id = $3 AND status = 'running' AND attempts = $4
        ",
    )
    .bind(lease_until)
    .bind(now)
    .bind(job_id)
    .bind(lease_epoch)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record the result and flip the job to `succeeded`, in one transaction.
///
/// The status update is conditional on the lease still being held; if the job
/// left `running` through another path (cancel, reclaim) the whole transaction
/// rolls back, so no result row is written either, and `false` is returned.
/// A job therefore never reaches `succeeded` without a result.
pub async fn complete_job(
    pool: &SqlitePool,
    job_id: i64,
    lease_epoch: i32,
    output: &JobOutput,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    sqlx::query("INSERT INTO job_results (job_id, summary, data, created_at) VALUES ($1, $2, $3, $4)")
        .bind(job_id)
        .bind(&output.summary)
        .bind(output.data.clone())
        .bind(now)
        .execute(&mut *tx)
        .await?;

    let updated = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'succeeded', finished_at = $1, lease_until = NULL, updated_at = $1
        WHERE id = $2 AND status = 'running' AND attempts = $3
        ",
    )
    .bind(now)
    .bind(job_id)
    .bind(lease_epoch)
    .execute(&mut *tx)
    .await?;

    if updated.rows_affected() == 1 {
        tx.commit().await?;
        Ok(true)
    } else {
        tx.rollback().await?;
        Ok(false)
    }
}

/// Return a failed job to the queue for another attempt.
///
/// Clears `error` and the lease; `attempts` keeps its value and counts against
/// `max_attempts` on the next claim. Conditional on the lease still being held.
pub async fn requeue_job(
    pool: &SqlitePool,
    job_id: i64,
    lease_epoch: i32,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();

    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'queued', error = NULL, lease_until = NULL, updated_at = $1
        WHERE id = $2 AND status = 'running' AND attempts = $3
        ",
    )
    .bind(now)
    .bind(job_id)
    .bind(lease_epoch)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Mark a job as terminally failed, recording the last error message.
///
/// Conditional on the lease still being held.
pub async fn mark_job_failed(
    pool: &SqlitePool,
    job_id: i64,
    lease_epoch: i32,
    error: &str,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();

    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'failed', error = $1, finished_at = $2, lease_until = NULL, updated_at = $2
        WHERE id = $3 AND status = 'running' AND attempts = $4
        ",
    )
    .bind(error)
    .bind(now)
    .bind(job_id)
    .bind(lease_epoch)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Cancel a `queued` or `running` job, bypassing any lease holder.
///
/// Best-effort cooperative cancellation: an in-flight task body is not
/// interrupted, but its terminal write will no-op against the now-terminal
/// row. Returns `false` for unknown ids and jobs that are already terminal.
pub async fn cancel_job(
    pool: &SqlitePool,
    job_id: i64,
    reason: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let now = Utc::now();

    let result = sqlx::query(
        r"
        UPDATE jobs
        SET status = 'cancelled', error = $1, finished_at = $2, lease_until = NULL, updated_at = $2
        WHERE id = $3 AND status IN ('queued', 'running')
        ",
    )
    .bind(reason.unwrap_or("cancelled"))
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Append a log entry for a job.
pub(crate) async fn append_log(
    pool: &SqlitePool,
    job_id: i64,
    level: LogLevel,
    msg: &str,
    data: Option<Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO job_logs (job_id, ts, level, msg, data) VALUES ($1, $2, $3, $4, $5)")
        .bind(job_id)
        .bind(Utc::now())
        .bind(level)
        .bind(msg)
        .bind(data)
        .execute(pool)
        .await?;
    Ok(())
}

/// Fetch a job by id.
pub async fn find_job(pool: &SqlitePool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Fetch just the current status of a job.
pub async fn job_status(pool: &SqlitePool, job_id: i64) -> Result<Option<JobStatus>, sqlx::Error> {
    sqlx::query_scalar::<_, JobStatus>("SELECT status FROM jobs WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Fetch the log entries for a job, in emission order.
pub async fn job_logs(pool: &SqlitePool, job_id: i64) -> Result<Vec<JobLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, JobLogEntry>(
        "SELECT id, job_id, ts, level, msg, data FROM job_logs WHERE job_id = $1 ORDER BY id ASC",
    )
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Fetch the authoritative (most recent) result for a job.
pub async fn latest_result(
    pool: &SqlitePool,
    job_id: i64,
) -> Result<Option<JobResult>, sqlx::Error> {
    sqlx::query_as::<_, JobResult>(
        r"
        SELECT id, job_id, summary, data, created_at
        FROM job_results
        WHERE job_id = $1
        ORDER BY id DESC
        LIMIT 1
        ",
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// The number of jobs that have terminally failed.
pub async fn failed_job_count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM jobs WHERE status = 'failed'")
        .fetch_one(pool)
        .await
}
