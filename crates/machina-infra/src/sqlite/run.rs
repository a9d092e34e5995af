//! SQLite run store.
//!
//! Implements `RunStore` from `machina-core`. Each run is one row keyed by
//! run id; the full `ExecutionContext` (values, shared values, history) is
//! stored as a JSON blob and replaced on every checkpoint. Status and
//! timestamps are duplicated into columns for listing.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use machina_core::repository::RunStore;
use machina_core::workflow::ExecutionContext;
use machina_types::error::RepositoryError;
use machina_types::run::RunStatus;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunStore`.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: DatabasePool,
}

/// Listing row for a stored run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub graph: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SqliteRunStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Runs whose last checkpoint is still RUNNING: candidates for resume
    /// after a crash.
    pub async fn list_unfinished(&self) -> Result<Vec<RunSummary>, RepositoryError> {
        self.list_by_status(RunStatus::Running).await
    }

    /// Runs in `status`, oldest first.
    pub async fn list_by_status(&self, status: RunStatus) -> Result<Vec<RunSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, graph, status, started_at, finished_at FROM workflow_runs WHERE status = ? ORDER BY started_at",
        )
        .bind(status_str(status)?)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter().map(summary_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn status_str(status: RunStatus) -> Result<String, RepositoryError> {
    match serde_json::to_value(status) {
        Ok(serde_json::Value::String(s)) => Ok(s),
        _ => Err(RepositoryError::Serialization(format!("run status {status}"))),
    }
}

fn parse_status(s: &str) -> Result<RunStatus, RepositoryError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid run status: {s}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn summary_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RunSummary, RepositoryError> {
    let get = |column: &str| -> Result<String, RepositoryError> {
        row.try_get(column).map_err(|e| RepositoryError::Query(e.to_string()))
    };
    let finished_at: Option<String> = row
        .try_get("finished_at")
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

    Ok(RunSummary {
        run_id: get("id")?
            .parse()
            .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))?,
        graph: get("graph")?,
        status: parse_status(&get("status")?)?,
        started_at: parse_datetime(&get("started_at")?)?,
        finished_at: finished_at.as_deref().map(parse_datetime).transpose()?,
    })
}

// ---------------------------------------------------------------------------
// RunStore impl
// ---------------------------------------------------------------------------

impl RunStore for SqliteRunStore {
    async fn load(&self, run_id: &Uuid) -> Result<Option<ExecutionContext>, RepositoryError> {
        let row = sqlx::query("SELECT context FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let json: String = row
                    .try_get("context")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                ExecutionContext::from_json(&json)
                    .map(Some)
                    .map_err(|e| RepositoryError::Serialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, context: &ExecutionContext) -> Result<(), RepositoryError> {
        let json = context
            .to_json()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs (id, graph, status, context, started_at, finished_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 graph = excluded.graph,
                 status = excluded.status,
                 context = excluded.context,
                 finished_at = excluded.finished_at,
                 updated_at = excluded.updated_at"#,
        )
        .bind(context.run_id.to_string())
        .bind(&context.graph)
        .bind(status_str(context.status)?)
        .bind(&json)
        .bind(context.started_at.to_rfc3339())
        .bind(context.finished_at.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, run_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
