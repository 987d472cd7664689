#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

//! Lease-protocol properties exercised directly against the storage layer:
//! claim atomicity, reclaim-on-expiry, epoch fencing and terminal-write races.

use claims::{assert_none, assert_some};
use joblease::schema::JobStatus;
use joblease::{JobOutput, storage};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::time::Duration;
use tempfile::TempDir;

static TRACING: std::sync::Once = std::sync::Once::new();

async fn setup_test_db() -> anyhow::Result<(SqlitePool, TempDir)> {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
    let dir = tempfile::tempdir()?;
    let pool = storage::connect(dir.path().join("jobs.db")).await?;
    storage::setup_database(&pool).await?;
    Ok((pool, dir))
}

async fn insert_job(pool: &SqlitePool, job_type: &str, max_attempts: i32) -> anyhow::Result<i64> {
    let id = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO jobs (job_type, payload, status, attempts, max_attempts, created_at, updated_at)
        VALUES ($1, '{}', 'queued', 0, $2, $3, $3)
        RETURNING id
        ",
    )
    .bind(job_type)
    .bind(max_attempts)
    .bind(chrono::Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

const LEASE: Duration = Duration::from_secs(60);
const SHORT_LEASE: Duration = Duration::from_millis(100);

#[tokio::test]
async fn claim_grants_lease_and_increments_attempts() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let job_id = insert_job(&pool, "scrape_statistics", 3).await?;

    let job = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert_eq!(job.id, job_id);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.attempts, 1);
    assert_some!(job.lease_until);
    assert_some!(job.started_at);
    assert_none!(job.finished_at);

    // The job is held; nothing else is eligible.
    assert_none!(storage::claim_next_job(&pool, LEASE).await?);

    Ok(())
}

#[tokio::test]
async fn claims_are_fifo_by_creation_time() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let first = insert_job(&pool, "a", 3).await?;
    let second = insert_job(&pool, "b", 3).await?;
    let third = insert_job(&pool, "c", 3).await?;

    let claimed: Vec<i64> = [
        assert_some!(storage::claim_next_job(&pool, LEASE).await?).id,
        assert_some!(storage::claim_next_job(&pool, LEASE).await?).id,
        assert_some!(storage::claim_next_job(&pool, LEASE).await?).id,
    ]
    .into();
    assert_eq!(claimed, [first, second, third]);

    Ok(())
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_job() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;

    let mut expected = HashSet::new();
    for _ in 0..6 {
        expected.insert(insert_job(&pool, "scrape_statistics", 3).await?);
    }

    // More claimants than jobs, all racing against the same store.
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = storage::claim_next_job(&pool, LEASE).await? {
                claimed.push(job.id);
            }
            anyhow::Ok(claimed)
        }));
    }

    let mut all_claimed = Vec::new();
    for task in tasks {
        all_claimed.extend(task.await??);
    }

    let unique: HashSet<i64> = all_claimed.iter().copied().collect();
    assert_eq!(unique.len(), all_claimed.len(), "a job was claimed twice");
    assert_eq!(unique, expected);

    Ok(())
}

#[tokio::test]
async fn expired_lease_is_reclaimed_with_incremented_attempts() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let job_id = insert_job(&pool, "scrape_statistics", 3).await?;

    let job = assert_some!(storage::claim_next_job(&pool, SHORT_LEASE).await?);
    assert_eq!(job.attempts, 1);
    let first_started_at = assert_some!(job.started_at);

    // Not before expiry...
    assert_none!(storage::claim_next_job(&pool, SHORT_LEASE).await?);

    // ...but exactly one reclaim after it, treated as a fresh lease grant.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let reclaimed = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert_eq!(reclaimed.id, job_id);
    assert_eq!(reclaimed.status, JobStatus::Running);
    assert_eq!(reclaimed.attempts, 2);
    // started_at marks the first grant only.
    assert_eq!(assert_some!(reclaimed.started_at), first_started_at);

    assert_none!(storage::claim_next_job(&pool, LEASE).await?);

    Ok(())
}

#[tokio::test]
async fn extending_the_lease_defers_reclaim() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    insert_job(&pool, "scrape_statistics", 3).await?;

    let job = assert_some!(storage::claim_next_job(&pool, Duration::from_millis(500)).await?);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(storage::extend_lease(&pool, job.id, job.attempts, Duration::from_millis(500)).await?);

    // Past the original deadline, inside the extended one.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_none!(storage::claim_next_job(&pool, LEASE).await?);

    // Past the extended deadline the job is reclaimable again.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reclaimed = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);

    Ok(())
}

#[tokio::test]
async fn stale_holder_writes_are_fenced_out_after_reclaim() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let job_id = insert_job(&pool, "scrape_statistics", 3).await?;

    let stale = assert_some!(storage::claim_next_job(&pool, SHORT_LEASE).await?);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let current = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert_eq!(current.attempts, 2);

    // Every holder-side write of the previous epoch must be a no-op.
    assert!(!storage::extend_lease(&pool, job_id, stale.attempts, LEASE).await?);
    assert!(!storage::requeue_job(&pool, job_id, stale.attempts).await?);
    assert!(!storage::mark_job_failed(&pool, job_id, stale.attempts, "stale error").await?);
    assert!(!storage::complete_job(&pool, job_id, stale.attempts, &JobOutput::new("stale")).await?);

    let job = assert_some!(storage::find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.attempts, 2);
    assert_none!(job.error);
    // The fenced-out completion must not have left a result row behind.
    assert_none!(storage::latest_result(&pool, job_id).await?);

    // The current holder is unaffected.
    assert!(storage::complete_job(&pool, job_id, current.attempts, &JobOutput::new("done")).await?);
    let job = assert_some!(storage::find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(assert_some!(storage::latest_result(&pool, job_id).await?).summary, "done");

    Ok(())
}

#[tokio::test]
async fn requeue_clears_error_and_lease() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let job_id = insert_job(&pool, "scrape_statistics", 3).await?;

    let job = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert!(storage::requeue_job(&pool, job_id, job.attempts).await?);

    let job = assert_some!(storage::find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempts, 1);
    assert_none!(job.error);
    assert_none!(job.lease_until);
    assert_none!(job.finished_at);

    // Requeued jobs are immediately eligible again.
    let job = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert_eq!(job.id, job_id);
    assert_eq!(job.attempts, 2);

    Ok(())
}

#[tokio::test]
async fn terminal_statuses_reject_all_later_writes() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let job_id = insert_job(&pool, "scrape_statistics", 3).await?;

    let job = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert!(storage::mark_job_failed(&pool, job_id, job.attempts, "gave up").await?);

    assert!(!storage::cancel_job(&pool, job_id, None).await?);
    assert!(!storage::requeue_job(&pool, job_id, job.attempts).await?);
    assert!(!storage::complete_job(&pool, job_id, job.attempts, &JobOutput::new("late")).await?);
    assert_none!(storage::claim_next_job(&pool, LEASE).await?);

    let job = assert_some!(storage::find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(assert_some!(job.error), "gave up");

    Ok(())
}

#[tokio::test]
async fn cancel_beats_in_flight_success() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    let job_id = insert_job(&pool, "scrape_statistics", 3).await?;

    let job = assert_some!(storage::claim_next_job(&pool, LEASE).await?);
    assert_eq!(assert_some!(storage::job_status(&pool, job_id).await?), JobStatus::Running);

    // Operator cancels while the lease holder is still working.
    assert!(storage::cancel_job(&pool, job_id, None).await?);

    // The holder's success write arrives late and must change nothing.
    assert!(!storage::complete_job(&pool, job_id, job.attempts, &JobOutput::new("late")).await?);

    let job = assert_some!(storage::find_job(&pool, job_id).await?);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(assert_some!(job.error), "cancelled");
    assert_some!(job.finished_at);
    assert_none!(job.lease_until);
    assert_none!(storage::latest_result(&pool, job_id).await?);

    Ok(())
}

#[tokio::test]
async fn cancelling_unknown_job_reports_nothing_to_do() -> anyhow::Result<()> {
    let (pool, _dir) = setup_test_db().await?;
    assert!(!storage::cancel_job(&pool, 4711, None).await?);
    Ok(())
}
