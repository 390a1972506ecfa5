//! SQL for the `batch_operations` table.
//!
//! Every statement that changes a row returns the row as it is afterwards, so
//! callers never need a second read on the happy path.
use crate::PgDateTime;

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct OperationRow {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub version: i64,
    pub payload: serde_json::Value,
    pub created_at: PgDateTime,
    pub updated_at: PgDateTime,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct VersionRow {
    pub status: String,
    pub version: i64,
}

const INSERT_OPERATION: &str = r#"
INSERT INTO batch_operations (id, kind, status, version, payload)
VALUES ($1, $2, 'pending', 0, $3)
ON CONFLICT (id) DO NOTHING
RETURNING id, kind, status, version, payload, created_at, updated_at
"#;

const SELECT_OPERATION: &str = r#"
SELECT id, kind, status, version, payload, created_at, updated_at
FROM batch_operations
WHERE id = $1
"#;

const SELECT_VERSION: &str = r#"
SELECT status, version
FROM batch_operations
WHERE id = $1
"#;

const TRANSITION_OPERATION: &str = r#"
UPDATE batch_operations
SET status = $4, version = version + 1, updated_at = now()
WHERE id = $1 AND version = $2 AND status = $3
RETURNING id, kind, status, version, payload, created_at, updated_at
"#;

const TOUCH_OPERATION: &str = r#"
UPDATE batch_operations
SET updated_at = now()
WHERE id = $1 AND version = $2 AND status = 'running'
"#;

const SELECT_STALLED: &str = r#"
SELECT id, kind, status, version, payload, created_at, updated_at
FROM batch_operations
WHERE status = 'running' AND updated_at < $1
ORDER BY updated_at
LIMIT $2
"#;

/// `None` when the id is taken.
pub(crate) async fn insert_operation<'e, E>(
    executor: E,
    id: &str,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<Option<OperationRow>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, OperationRow>(INSERT_OPERATION)
        .bind(id)
        .bind(kind)
        .bind(payload)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn select_operation<'e, E>(
    executor: E,
    id: &str,
) -> Result<Option<OperationRow>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, OperationRow>(SELECT_OPERATION)
        .bind(id)
        .fetch_optional(executor)
        .await
}

pub(crate) async fn select_version<'e, E>(
    executor: E,
    id: &str,
) -> Result<Option<VersionRow>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, VersionRow>(SELECT_VERSION)
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// `None` when the row is missing, at another version, or in another state.
pub(crate) async fn transition_operation<'e, E>(
    executor: E,
    id: &str,
    expected_version: i64,
    from: &str,
    to: &str,
) -> Result<Option<OperationRow>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, OperationRow>(TRANSITION_OPERATION)
        .bind(id)
        .bind(expected_version)
        .bind(from)
        .bind(to)
        .fetch_optional(executor)
        .await
}

/// Number of rows refreshed; zero on a miss.
pub(crate) async fn touch_operation<'e, E>(
    executor: E,
    id: &str,
    version: i64,
) -> Result<u64, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(TOUCH_OPERATION)
        .bind(id)
        .bind(version)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn select_stalled<'e, E>(
    executor: E,
    older_than: PgDateTime,
    limit: i64,
) -> Result<Vec<OperationRow>, sqlx::Error>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query_as::<_, OperationRow>(SELECT_STALLED)
        .bind(older_than)
        .bind(limit)
        .fetch_all(executor)
        .await
}
