use crate::heartbeat::LeaseHeartbeat;
use crate::job_log::JobLogger;
use crate::job_registry::JobRegistry;
use crate::schema::Job;
use crate::storage;
use crate::util::try_to_extract_panic_info;
use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::json;
use sqlx::SqlitePool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: SqlitePool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
    pub(crate) lease_duration: Duration,
    pub(crate) heartbeat_interval: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::rng().random_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No leasable jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No leasable jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next eligible job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was claimed
    /// - `Ok(None)` if no jobs were eligible
    /// - `Err(...)` if the claim itself failed (store unreachable)
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        trace!("Looking for next leasable job…");

        let Some(job) = storage::claim_next_job(&self.connection_pool, self.lease_duration).await?
        else {
            return Ok(None);
        };

        let span = info_span!("job", job.id = %job.id, job.job_type = %job.job_type);
        let job_id = job.id;

        self.run_claimed_job(job).instrument(span).await?;

        Ok(Some(job_id))
    }

    /// Execute the task body under the held lease and perform exactly one
    /// terminal or retry transition.
    #[allow(clippy::cognitive_complexity)]
    async fn run_claimed_job(&self, job: Job) -> anyhow::Result<()> {
        let pool = &self.connection_pool;
        // The attempts value set by our claim fences all writes below: once
        // the job is reclaimed or cancelled, they affect zero rows.
        let lease_epoch = job.attempts;
        let logger = JobLogger::new(pool.clone(), job.id);

        debug!("Leased job…");
        logger
            .info_with("leased", json!({ "attempt": job.attempts }))
            .await;

        // Cancellation checkpoint: a cancel may have landed right after our
        // claim. Best-effort; the conditional writes below close the race.
        if let Some(status) = storage::job_status(pool, job.id).await? {
            if status.is_terminal() {
                debug!(%status, "Job reached a terminal status before execution started");
                return Ok(());
            }
        }

        let heartbeat = LeaseHeartbeat::start(
            pool.clone(),
            job.id,
            lease_epoch,
            self.lease_duration,
            self.heartbeat_interval,
        );

        let run_result = match self.job_registry.get(&job.job_type).cloned() {
            Some(run_task_fn) => {
                let future = run_task_fn(self.context.clone(), job.payload.clone(), logger.clone());
                AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .map_err(|e| try_to_extract_panic_info(&*e))
                    // TODO: Replace with flatten() once that stabilizes
                    .and_then(std::convert::identity)
            }
            None => Err(anyhow!("Unknown job type {}", job.job_type)),
        };

        // Stop extending the lease before touching the job's terminal state.
        drop(heartbeat);

        match run_result {
            Ok(output) => match storage::complete_job(pool, job.id, lease_epoch, &output).await {
                Ok(true) => debug!("Job succeeded"),
                Ok(false) => {
                    warn!("Job left the running state during execution; discarding success")
                }
                Err(error) => {
                    // No result, no success claim: treat as a task failure.
                    warn!(%error, "Failed to record job result");
                    let error = anyhow!("failed to record result: {error}");
                    self.finish_failed(&logger, &job, lease_epoch, &error).await?;
                }
            },
            Err(error) => {
                warn!("Failed to run job: {error}");
                self.finish_failed(&logger, &job, lease_epoch, &error).await?;
            }
        }

        Ok(())
    }

    /// Retry-vs-terminal decision. The task body has no authority here.
    async fn finish_failed(
        &self,
        logger: &JobLogger,
        job: &Job,
        lease_epoch: i32,
        error: &anyhow::Error,
    ) -> anyhow::Result<()> {
        logger
            .error_with("task_failed", json!({ "error": error.to_string() }))
            .await;

        let pool = &self.connection_pool;
        let applied = if job.attempts < job.max_attempts {
            storage::requeue_job(pool, job.id, lease_epoch).await?
        } else {
            storage::mark_job_failed(pool, job.id, lease_epoch, &error.to_string()).await?
        };

        if !applied {
            warn!("Job left the running state during execution; discarding failure");
        }

        Ok(())
    }
}
