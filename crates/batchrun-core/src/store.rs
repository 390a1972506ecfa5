//! Storage seam for batch operation records.
//!
//! The store owns durability and conflict detection; everything above it
//! only sees records and versions.
//!
//! ## OCC
//!
//! [`OperationStore::transition`] is a compare-and-set on `(version, status)`.
//! Exactly one of several writers holding the same version can win; the rest
//! get [`StoreError::ConcurrentModification`].
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt as _, StreamExt as _};

use crate::operation::{
    BatchOperation, Event, OperationId, OperationRecord, OperationRepository, OperationStatus, Work,
};
use crate::runner::RunError;
use crate::utils::Ticker;

/// All errors that can be returned by an [`OperationStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record with the given id.
    #[error("batch operation not found: {id}")]
    NotFound { id: OperationId },

    /// A record with this id already exists.
    #[error("batch operation already exists: {id}")]
    AlreadyExists { id: OperationId },

    /// Another writer moved the record past `expected_version`.
    #[error("concurrent modification of batch operation {id}: expected version {expected_version}")]
    ConcurrentModification {
        id: OperationId,
        expected_version: i64,
    },

    /// The record is at the expected version but cannot take `event`.
    #[error("batch operation {id} cannot {event} from {status}")]
    InvalidTransition {
        id: OperationId,
        status: OperationStatus,
        event: Event,
    },

    /// Connection, query or decoding failure in the backing store.
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Durable home of operation records.
pub trait OperationStore: Send + Sync + 'static {
    /// Read the current record.
    fn fetch(
        &self,
        id: &OperationId,
    ) -> impl Future<Output = Result<OperationRecord, StoreError>> + Send;

    /// Apply `event` if the record is still at `expected_version`.
    ///
    /// Returns the updated record with `version = expected_version + 1`.
    fn transition(
        &self,
        id: &OperationId,
        expected_version: i64,
        event: Event,
    ) -> impl Future<Output = Result<OperationRecord, StoreError>> + Send;

    /// Refresh `updated_at` of a running record still at `version`.
    ///
    /// The version is left alone. A miss is classified like a failed
    /// `Finish` transition.
    fn touch(
        &self,
        id: &OperationId,
        version: i64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Running operations not updated since `older_than`, oldest first.
    fn list_stalled(
        &self,
        older_than: std::time::SystemTime,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<OperationRecord>, StoreError>> + Send;
}

/// Decide why a conditional update touched nothing.
///
/// `current` is the record as re-read after the failed compare-and-set, or
/// `None` if it no longer exists.
pub fn classify_missed_transition(
    id: &OperationId,
    expected_version: i64,
    event: Event,
    current: Option<(OperationStatus, i64)>,
) -> StoreError {
    match current {
        None => StoreError::NotFound { id: id.clone() },
        Some((_, version)) if version != expected_version => StoreError::ConcurrentModification {
            id: id.clone(),
            expected_version,
        },
        Some((status, _)) => StoreError::InvalidTransition {
            id: id.clone(),
            status,
            event,
        },
    }
}

/// [`BatchOperation`] backed by an [`OperationStore`] record.
///
/// Holds the last record it observed; every transition goes through the
/// store with that record's version. While the work runs, the record is
/// touched every `heartbeat` so the reaper does not take it for stranded.
pub struct StoredOperation<S, W> {
    record: OperationRecord,
    store: Arc<S>,
    work: Arc<W>,
    heartbeat: Option<Duration>,
}

impl<S, W> std::fmt::Debug for StoredOperation<S, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredOperation")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl<S, W> StoredOperation<S, W>
where
    S: OperationStore,
    W: Work,
{
    pub fn new(record: OperationRecord, store: Arc<S>, work: Arc<W>) -> Self {
        Self {
            record,
            store,
            work,
            heartbeat: None,
        }
    }

    /// Touch the record every `period` while the work runs.
    pub fn heartbeat(self, period: Duration) -> Self {
        Self {
            heartbeat: Some(period),
            ..self
        }
    }

    pub fn record(&self) -> &OperationRecord {
        &self.record
    }

    async fn apply(&mut self, event: Event) -> Result<(), RunError> {
        if self.record.status.apply(event).is_none() {
            return Err(RunError::InvalidTransition {
                id: self.record.id.clone(),
                status: self.record.status,
                event,
            });
        }

        let updated = self
            .store
            .transition(&self.record.id, self.record.version, event)
            .await?;
        tracing::debug!(
            operation_id = %updated.id,
            from = %self.record.status,
            to = %updated.status,
            version = updated.version,
            "batch operation transitioned"
        );
        self.record = updated;
        Ok(())
    }
}

impl<S, W> BatchOperation for StoredOperation<S, W>
where
    S: OperationStore,
    W: Work,
{
    fn id(&self) -> &OperationId {
        &self.record.id
    }

    fn status(&self) -> OperationStatus {
        self.record.status
    }

    async fn start(&mut self) -> Result<(), RunError> {
        self.apply(Event::Start).await
    }

    async fn run(&mut self) -> Result<(), RunError> {
        if self.record.status != OperationStatus::Running {
            return Err(RunError::NotRunning {
                id: self.record.id.clone(),
                status: self.record.status,
            });
        }

        let work = Arc::clone(&self.work);
        let record = self.record.clone();
        let outcome = {
            let work_fut = work.execute(&record).fuse();
            futures::pin_mut!(work_fut);
            match self.heartbeat {
                None => work_fut.await,
                Some(period) => {
                    let mut tick = Ticker::new(period).fuse();
                    loop {
                        futures::select! {
                            res = work_fut => break res,
                            _ = tick.next() => {
                                let touched = self.store.touch(&record.id, record.version).await;
                                if let Err(error) = touched {
                                    tracing::warn!(
                                        error = %error,
                                        operation_id = %record.id,
                                        "Failed to refresh running batch operation"
                                    );
                                }
                            }
                        }
                    }
                }
            }
        };
        let Err(source) = outcome else {
            return Ok(());
        };

        // Leave a failed run visible instead of stuck in `running`.
        if let Err(error) = self.apply(Event::Fail).await {
            tracing::error!(
                error = %error,
                operation_id = %self.record.id,
                "Failed to mark batch operation as failed"
            );
        }

        Err(RunError::DomainExecutionFailure {
            id: self.record.id.clone(),
            source,
        })
    }

    async fn finish(&mut self) -> Result<(), RunError> {
        match self.apply(Event::Finish).await {
            Err(RunError::ConcurrentModification { id }) => {
                let current = self.store.fetch(&id).await?;
                if current.status != OperationStatus::Failed {
                    return Err(RunError::ConcurrentModification { id });
                }
                tracing::error!(
                    operation_id = %id,
                    version = current.version,
                    "batch operation was reaped while its work was running"
                );
                self.record = current;
                Err(RunError::Reaped { id })
            }
            other => other,
        }
    }
}

/// Repository producing [`StoredOperation`]s that share one store and one
/// piece of domain work.
pub struct StoreRepository<S, W> {
    store: Arc<S>,
    work: Arc<W>,
    heartbeat: Option<Duration>,
}

impl<S, W> Clone for StoreRepository<S, W> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            work: Arc::clone(&self.work),
            heartbeat: self.heartbeat,
        }
    }
}

impl<S, W> StoreRepository<S, W>
where
    S: OperationStore,
    W: Work,
{
    pub fn new(store: Arc<S>, work: W) -> Self {
        Self {
            store,
            work: Arc::new(work),
            heartbeat: None,
        }
    }

    /// Keep running operations fresh every `period`; see
    /// [`StoredOperation::heartbeat`].
    pub fn heartbeat(self, period: Duration) -> Self {
        Self {
            heartbeat: Some(period),
            ..self
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S, W> OperationRepository for StoreRepository<S, W>
where
    S: OperationStore,
    W: Work,
{
    type Operation = StoredOperation<S, W>;

    async fn find(&self, id: &OperationId) -> Result<Self::Operation, RunError> {
        let record = self.store.fetch(id).await?;
        let operation =
            StoredOperation::new(record, Arc::clone(&self.store), Arc::clone(&self.work));
        Ok(match self.heartbeat {
            Some(period) => operation.heartbeat(period),
            None => operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missed_transition_on_missing_row_is_not_found() {
        let id = OperationId::from("B1");
        let error = classify_missed_transition(&id, 0, Event::Start, None);
        assert!(matches!(error, StoreError::NotFound { .. }));
    }

    #[test]
    fn missed_transition_on_newer_version_is_conflict() {
        let id = OperationId::from("B1");
        let error = classify_missed_transition(
            &id,
            0,
            Event::Start,
            Some((OperationStatus::Running, 1)),
        );
        assert!(matches!(
            error,
            StoreError::ConcurrentModification {
                expected_version: 0,
                ..
            }
        ));
    }

    #[test]
    fn missed_transition_on_same_version_is_invalid() {
        let id = OperationId::from("B1");
        let error = classify_missed_transition(
            &id,
            2,
            Event::Start,
            Some((OperationStatus::Finished, 2)),
        );
        assert!(matches!(
            error,
            StoreError::InvalidTransition {
                status: OperationStatus::Finished,
                event: Event::Start,
                ..
            }
        ));
    }
}
