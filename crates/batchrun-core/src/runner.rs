//! Drive one batch operation through start, run and finish.
//!
//! Delivery is at-least-once, so the runner leans on the operation's own
//! guards instead of queue ordering:
//! - Only a pending operation starts; anything else is a successful no-op.
//! - Starting is a versioned write, so two racing deliveries cannot both win.
//! - The loser gets a retryable conflict and resolves to a no-op next time.
//!
//! The three phase writes are independent. A crash between them leaves the
//! operation `running`; [`Reaper`](crate::reaper::Reaper) reconciles those.
use std::sync::Arc;

use futures::FutureExt as _;
use serde::{Deserialize, Serialize};

use crate::JobHandler;
use crate::operation::{
    BatchOperation, Event, OperationId, OperationRepository, OperationStatus, WorkError,
};
use crate::retry::{Disposition, Retryable};
use crate::store::StoreError;

/// Failure of a single runner invocation.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The identifier does not resolve to an operation. Never retried.
    #[error("batch operation not found: {id}")]
    NotFound { id: OperationId },

    /// A competing invocation changed the operation first.
    #[error("batch operation {id} was modified concurrently")]
    ConcurrentModification { id: OperationId },

    /// A transition was requested from a state that does not allow it.
    #[error("batch operation {id} cannot {event} from {status}")]
    InvalidTransition {
        id: OperationId,
        status: OperationStatus,
        event: Event,
    },

    /// Domain work was requested for an operation that has not started.
    #[error("batch operation {id} is {status}, not running")]
    NotRunning {
        id: OperationId,
        status: OperationStatus,
    },

    /// The work succeeded but the reaper failed the operation first.
    #[error("batch operation {id} was reaped before it could finish")]
    Reaped { id: OperationId },

    /// Domain work failed during the run phase.
    #[error("batch operation {id} failed during run")]
    DomainExecutionFailure {
        id: OperationId,
        #[source]
        source: WorkError,
    },

    /// The store could not be reached or returned garbage.
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for RunError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::NotFound { id } => RunError::NotFound { id },
            StoreError::ConcurrentModification { id, .. } => {
                RunError::ConcurrentModification { id }
            }
            StoreError::InvalidTransition { id, status, event } => {
                RunError::InvalidTransition { id, status, event }
            }
            other => RunError::Storage(other),
        }
    }
}

impl Retryable for RunError {
    fn disposition(&self) -> Disposition {
        match self {
            RunError::ConcurrentModification { .. } | RunError::Storage(_) => Disposition::Retry,
            RunError::NotFound { .. }
            | RunError::InvalidTransition { .. }
            | RunError::NotRunning { .. }
            | RunError::Reaped { .. }
            | RunError::DomainExecutionFailure { .. } => Disposition::Discard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a successful invocation did.
pub enum Outcome {
    /// The operation was not startable; nothing changed.
    Skipped,
    /// The operation went from pending to finished.
    Finished,
}

/// Job payload handed over at the dispatch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBatchOperation {
    pub batch_operation_id: OperationId,
}

impl RunBatchOperation {
    pub fn new(batch_operation_id: impl Into<OperationId>) -> Self {
        Self {
            batch_operation_id: batch_operation_id.into(),
        }
    }
}

/// Stateless executor for batch operations.
///
/// Cloning is cheap; clones share the repository.
pub struct BatchOperationRunner<R> {
    repository: Arc<R>,
}

impl<R> Clone for BatchOperationRunner<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

impl<R> BatchOperationRunner<R>
where
    R: OperationRepository,
{
    pub fn new(repository: R) -> Self {
        Self {
            repository: Arc::new(repository),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Execute the operation identified by `id` once.
    pub async fn perform(&self, id: &OperationId) -> Result<Outcome, RunError> {
        let mut operation = self.repository.find(id).await?;

        if !operation.may_start() {
            tracing::debug!(
                operation_id = %id,
                status = %operation.status(),
                "batch operation not startable, skipping"
            );
            return Ok(Outcome::Skipped);
        }

        tracing::info!(operation_id = %id, operation = ?operation, "batch operation starting");

        operation.start().await?;
        operation
            .run()
            .await
            .inspect_err(|error| {
                tracing::error!(error = %error, operation_id = %id, "batch operation run failed")
            })?;
        operation.finish().await?;

        tracing::info!(operation_id = %id, "batch operation finished");
        Ok(Outcome::Finished)
    }
}

impl<R> JobHandler<RunBatchOperation> for BatchOperationRunner<R>
where
    R: OperationRepository,
{
    type Data = RunBatchOperation;
    type Error = RunError;
    type Future = futures::future::BoxFuture<'static, Result<(), RunError>>;

    fn call(self, data: Self::Data) -> Self::Future {
        async move {
            self.perform(&data.batch_operation_id)
                .await
                .map(|_outcome| ())
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_run_errors() {
        let id = OperationId::from("B1");

        let error = RunError::from(StoreError::NotFound { id: id.clone() });
        assert!(matches!(error, RunError::NotFound { .. }));

        let error = RunError::from(StoreError::ConcurrentModification {
            id: id.clone(),
            expected_version: 3,
        });
        assert!(matches!(error, RunError::ConcurrentModification { .. }));

        let error = RunError::from(StoreError::Backend("connection reset".into()));
        assert!(matches!(error, RunError::Storage(_)));
    }

    #[test]
    fn only_conflicts_and_storage_faults_are_retried() {
        let id = OperationId::from("B1");

        assert_eq!(
            RunError::ConcurrentModification { id: id.clone() }.disposition(),
            Disposition::Retry
        );
        assert_eq!(
            RunError::Storage(StoreError::Backend("timeout".into())).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            RunError::NotFound { id: id.clone() }.disposition(),
            Disposition::Discard
        );
        assert_eq!(
            RunError::Reaped { id: id.clone() }.disposition(),
            Disposition::Discard
        );
        assert_eq!(
            RunError::DomainExecutionFailure {
                id: id.clone(),
                source: "boom".into(),
            }
            .disposition(),
            Disposition::Discard
        );
        assert_eq!(
            RunError::InvalidTransition {
                id,
                status: OperationStatus::Finished,
                event: Event::Start,
            }
            .disposition(),
            Disposition::Discard
        );
    }

    #[test]
    fn payload_field_is_batch_operation_id() {
        let payload: RunBatchOperation =
            serde_json::from_str(r#"{"batch_operation_id":"17"}"#).unwrap();
        assert_eq!(payload, RunBatchOperation::new("17"));
    }
}
