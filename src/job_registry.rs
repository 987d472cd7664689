use crate::job_handler::{JobHandler, JobOutput};
use crate::job_log::JobLogger;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type RunTaskFn<Context> =
    dyn Fn(Context, Value, JobLogger) -> BoxFuture<'static, anyhow::Result<JobOutput>> + Send + Sync;

/// Maps job type tags to their task bodies.
///
/// Dispatch is additive: registering a new job type never touches existing
/// ones. A claimed job whose type is missing here is a task-body failure at
/// the worker, counting toward its retry budget.
pub(crate) struct JobRegistry<Context> {
    job_types: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            job_types: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            job_types: self.job_types.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: JobHandler<Context = Context>>(&mut self) {
        self.job_types
            .insert(J::JOB_TYPE.to_string(), Arc::new(run_job::<J>));
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&Arc<RunTaskFn<Context>>> {
        self.job_types.get(job_type)
    }

    pub(crate) fn job_types(&self) -> Vec<&str> {
        self.job_types.keys().map(String::as_str).collect()
    }
}

fn run_job<J: JobHandler>(
    ctx: J::Context,
    payload: Value,
    log: JobLogger,
) -> BoxFuture<'static, anyhow::Result<JobOutput>> {
    async move {
        let job: J = serde_json::from_value(payload)?;
        job.run(ctx, log).await
    }
    .boxed()
}
