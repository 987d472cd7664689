use crate::JobHandler;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);
const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(45);

/// The core runner responsible for leasing and running jobs.
///
/// Spawns one or more [`Worker`]s over a shared connection pool. Multiple
/// runner processes may point at the same database file; the atomic claim in
/// the store is the only coordination between them.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    connection_pool: SqlitePool,
    job_registry: JobRegistry<Context>,
    context: Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    lease_duration: Duration,
    heartbeat_interval: Duration,
    shutdown_when_queue_empty: bool,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send + 'static> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.job_registry.job_types())
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: SqlitePool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            lease_duration: DEFAULT_LEASE_DURATION,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_when_queue_empty: false,
        }
    }

    /// Register a job type so claimed jobs with its tag can be dispatched.
    pub fn register_job_type<J: JobHandler<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Set the number of workers this runner spawns.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set how long each granted lease lasts before an unheartbeated job is
    /// considered abandoned and becomes eligible for reclaim.
    pub fn lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Set how often a worker extends its held lease.
    ///
    /// Must be strictly shorter than the lease duration.
    pub fn heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Set the runner to shut down when no jobs are eligible for leasing.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers
    /// to shut down.
    pub fn start(&self) -> RunHandle {
        if self.heartbeat_interval >= self.lease_duration {
            warn!(
                heartbeat_interval = ?self.heartbeat_interval,
                lease_duration = ?self.lease_duration,
                "Heartbeat interval is not shorter than the lease duration; leases will lapse mid-run"
            );
        }

        let mut handles = Vec::new();
        let job_registry = Arc::new(self.job_registry.clone());

        for i in 1..=self.num_workers {
            let name = format!("worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                connection_pool: self.connection_pool.clone(),
                context: self.context.clone(),
                job_registry: job_registry.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
                lease_duration: self.lease_duration,
                heartbeat_interval: self.heartbeat_interval,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle { handles }
    }
}

/// Handle to a running job processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker task panicked");
            }
        });
    }
}
