//! Run batch operations from an at-least-once job queue, safely.
//!
//! - The runner drives an operation through start, run and finish, and turns
//!   duplicate deliveries into no-ops through the operation's own guards.
//! - The store detects concurrent writers with versioned updates; nothing
//!   relies on queue ordering.
//! - The worker polls a backend, runs handlers with bounded concurrency and
//!   turns handler errors into complete, retry or discard.
//!
//! Storage and transport stay behind traits; this crate ships in-memory
//! implementations of both.
pub mod backend;
pub mod config;
pub mod memory;
pub mod operation;
pub mod reaper;
pub mod retry;
pub mod runner;
pub mod store;
pub mod utils;
pub mod worker;

#[cfg(feature = "rt-tokio")]
mod tokio_spawner;
#[cfg(feature = "rt-tokio")]
pub use tokio_spawner::TokioSpawner;

pub use backend::{BackEndContext, BackEndDriver, BackEndPoller, Heartbeat, Job};
pub use config::{QueueConfig, Settings, parse_queue_name};
pub use operation::{
    BatchOperation, Event, NewOperation, OperationId, OperationRecord, OperationRepository,
    OperationStatus, Work, WorkError,
};
pub use reaper::Reaper;
pub use retry::{Disposition, RetryPolicy, Retryable};
pub use runner::{BatchOperationRunner, Outcome, RunBatchOperation, RunError};
pub use store::{OperationStore, StoreError, StoreRepository, StoredOperation};
pub use worker::{Worker, WorkerBuilder, WorkerWithGracefulShutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Outcome the backend persists for a delivered job.
///
/// - `Complete`: handled; remove from the queue.
/// - `Retry`: transient failure; deliver again, optionally after a delay.
/// - `Discard`: permanent failure; do not waste capacity on it.
pub enum JobResult {
    /// Mark the job as successfully completed.
    Complete,
    /// Requeue the job after an optional delay.
    Retry(Option<std::time::Duration>),
    /// Drop the job without retrying.
    Discard,
}

/// Something that can perform a delivered job.
///
/// The `M` parameter only disambiguates the blanket implementations; the
/// runner uses its payload type, closures use [`JobData`].
pub trait JobHandler<M>: Send + Sync + Clone + 'static {
    /// The payload this handler consumes.
    type Data: Send + 'static;
    /// Failure reported back to the retry policy.
    type Error: Retryable + std::fmt::Display + Send + 'static;

    type Future: Future<Output = Result<(), Self::Error>> + Send;

    fn call(self, data: Self::Data) -> Self::Future;
}

/// Explicitly opt-in to receive the payload in a closure handler.
pub struct JobData<T>(pub T);

impl<F, Fut, T, E> JobHandler<JobData<T>> for F
where
    T: Send + 'static,
    E: Retryable + std::fmt::Display + Send + 'static,
    F: FnOnce(JobData<T>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
{
    type Data = T;
    type Error = E;
    type Future = Fut;

    fn call(self, data: Self::Data) -> Self::Future {
        self(JobData(data))
    }
}
