/// Errors that can occur while enqueueing a job.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// The job row could not be written to the store.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}
