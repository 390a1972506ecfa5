//! Idempotent batch operation dispatch.
//!
//! The core crate holds the runner, the dispatch worker and the storage
//! seams; enable `postgres` for the sqlx-backed operation store.
pub use batchrun_core;
pub use batchrun_core::{
    BatchOperationRunner, JobData, JobResult, Outcome, QueueConfig, RetryPolicy,
    RunBatchOperation, RunError, Settings, Worker, WorkerBuilder, WorkerWithGracefulShutdown,
};
pub use batchrun_core::{backend, worker};

#[cfg(feature = "rt-tokio")]
pub use batchrun_core::TokioSpawner;

#[cfg(feature = "postgres")]
pub use batchrun_sqlx;
#[cfg(feature = "postgres")]
pub use batchrun_sqlx::PgOperationStore;
