//! PostgreSQL-backed [`OperationStore`].
use batchrun_core::{
    Event, NewOperation, OperationId, OperationRecord, OperationStatus, OperationStore, StoreError,
    store::classify_missed_transition,
};

use crate::{PgDateTime, queries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of failures inside the PostgreSQL store.
pub enum ErrorKind {
    /// An error was returned by the database layer.
    DataBase,
    /// A row did not decode into an operation record.
    Decode,
}

#[derive(Debug)]
/// Error raised by [`PgOperationStore`]; surfaces as [`StoreError::Backend`].
pub struct Error {
    kind: ErrorKind,
    inner: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl Error {
    fn new_decode(error: Box<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        Error {
            kind: ErrorKind::Decode,
            inner: error,
        }
    }

    /// Return the category of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        Self {
            kind: ErrorKind::DataBase,
            inner: Box::new(value),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(value: sqlx::migrate::MigrateError) -> Self {
        Self {
            kind: ErrorKind::DataBase,
            inner: Box::new(value),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

impl From<Error> for StoreError {
    fn from(value: Error) -> Self {
        StoreError::Backend(Box::new(value))
    }
}

fn backend(error: sqlx::Error) -> StoreError {
    Error::from(error).into()
}

impl TryFrom<queries::OperationRow> for OperationRecord {
    type Error = Error;

    fn try_from(row: queries::OperationRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<OperationStatus>()
            .map_err(|e| Error::new_decode(Box::new(e)))?;
        Ok(OperationRecord {
            id: OperationId::new(row.id),
            kind: row.kind,
            status,
            version: row.version,
            payload: row.payload,
            created_at: row.created_at.0,
            updated_at: row.updated_at.0,
        })
    }
}

/// Operation records in the `batch_operations` table.
///
/// Every transition is a single conditional `UPDATE`; a miss is re-read once
/// to tell a conflict from a missing row or a wrong state.
#[derive(Debug, Clone)]
pub struct PgOperationStore {
    pool: sqlx::PgPool,
}

impl PgOperationStore {
    pub const fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool for `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        let pool = sqlx::PgPool::connect(database_url).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Create or upgrade the `batch_operations` table.
    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Create a pending operation at version 0.
    pub async fn insert(&self, operation: &NewOperation) -> Result<OperationRecord, StoreError> {
        let row = queries::insert_operation(
            &self.pool,
            operation.id.as_str(),
            &operation.kind,
            &operation.payload,
        )
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(OperationRecord::try_from(row)?),
            None => Err(StoreError::AlreadyExists {
                id: operation.id.clone(),
            }),
        }
    }

    /// Status and version as re-read after a conditional update missed.
    async fn current_version(
        &self,
        id: &OperationId,
    ) -> Result<Option<(OperationStatus, i64)>, StoreError> {
        let row = queries::select_version(&self.pool, id.as_str())
            .await
            .map_err(backend)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status = row
            .status
            .parse::<OperationStatus>()
            .map_err(|e| Error::new_decode(Box::new(e)))?;
        Ok(Some((status, row.version)))
    }
}

impl OperationStore for PgOperationStore {
    async fn fetch(&self, id: &OperationId) -> Result<OperationRecord, StoreError> {
        let row = queries::select_operation(&self.pool, id.as_str())
            .await
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound { id: id.clone() })?;
        Ok(OperationRecord::try_from(row)?)
    }

    async fn transition(
        &self,
        id: &OperationId,
        expected_version: i64,
        event: Event,
    ) -> Result<OperationRecord, StoreError> {
        let updated = queries::transition_operation(
            &self.pool,
            id.as_str(),
            expected_version,
            event.source().as_str(),
            event.target().as_str(),
        )
        .await
        .map_err(backend)?;

        if let Some(row) = updated {
            return Ok(OperationRecord::try_from(row)?);
        }

        let current = self.current_version(id).await?;
        tracing::debug!(
            operation_id = %id,
            expected_version,
            event = %event,
            "conditional update matched no row"
        );

        Err(classify_missed_transition(id, expected_version, event, current))
    }

    async fn touch(&self, id: &OperationId, version: i64) -> Result<(), StoreError> {
        let touched = queries::touch_operation(&self.pool, id.as_str(), version)
            .await
            .map_err(backend)?;
        if touched > 0 {
            return Ok(());
        }

        let current = self.current_version(id).await?;
        Err(classify_missed_transition(id, version, Event::Finish, current))
    }

    async fn list_stalled(
        &self,
        older_than: std::time::SystemTime,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = queries::select_stalled(&self.pool, PgDateTime(older_than), limit)
            .await
            .map_err(backend)?;

        rows.into_iter()
            .map(|row| OperationRecord::try_from(row).map_err(StoreError::from))
            .collect()
    }
}
