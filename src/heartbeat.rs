use crate::storage;
use sqlx::SqlitePool;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{trace, warn};

/// Keeps a held lease alive while the task body runs.
///
/// One instance per held lease. The guard aborts its background ticker on
/// `Drop`, so the extender stops on every exit path of the owning worker,
/// including panics unwinding through the task body. A leaked extender would
/// keep renewing a lease for a job its owner already moved on from.
pub(crate) struct LeaseHeartbeat {
    handle: AbortHandle,
}

impl LeaseHeartbeat {
    /// Start extending the lease on `job_id` every `interval`.
    ///
    /// `interval` must be strictly shorter than `lease_duration`, otherwise
    /// the lease lapses between ticks and the job gets reclaimed under us.
    pub(crate) fn start(
        pool: SqlitePool,
        job_id: i64,
        lease_epoch: i32,
        lease_duration: Duration,
        interval: Duration,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; the claim already set the
            // initial lease, so skip it.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match storage::extend_lease(&pool, job_id, lease_epoch, lease_duration).await {
                    Ok(true) => trace!(job.id = job_id, "Extended lease"),
                    Ok(false) => {
                        warn!(job.id = job_id, "Lease no longer held, stopping heartbeat");
                        break;
                    }
                    // A single failed extension is not fatal; the lease only
                    // lapses if failures persist past the deadline, and that
                    // case is handled as a reclaim by another worker.
                    Err(error) => warn!(job.id = job_id, %error, "Failed to extend lease"),
                }
            }
        });

        Self {
            handle: task.abort_handle(),
        }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
