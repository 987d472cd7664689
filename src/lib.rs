#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod errors;
mod heartbeat;
mod job_handler;
mod job_log;
mod job_registry;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Job store operations: leasing, lifecycle transitions and the read model.
pub mod storage;
mod util;
mod worker;

/// Error type for job enqueueing operations.
pub use self::errors::EnqueueError;
/// The main trait for defining job task bodies.
pub use self::job_handler::{JobHandler, JobOutput};
/// Append-only log handle available to running task bodies.
pub use self::job_log::JobLogger;
/// The main runner that orchestrates job processing.
pub use self::runner::{RunHandle, Runner};
