//! Database query functions for the append-only `task_unit_histories` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskUnitHistory;

/// Parameters for appending a completed-unit summary.
#[derive(Debug, Clone)]
pub struct NewUnitHistory<'a> {
    pub task_id: Uuid,
    pub unit_name: &'a str,
    /// The selection pattern the unit was matched by (schema for tables,
    /// index pattern for indices). Used for grouping in history views.
    pub pattern: &'a str,
    pub total_records: i64,
    pub duration_ms: i64,
}

/// Append a completed-unit summary row.
pub async fn record_history(pool: &PgPool, new: &NewUnitHistory<'_>) -> Result<TaskUnitHistory> {
    let history = sqlx::query_as::<_, TaskUnitHistory>(
        "INSERT INTO task_unit_histories (task_id, unit_name, pattern, total_records, duration_ms) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.unit_name)
    .bind(new.pattern)
    .bind(new.total_records)
    .bind(new.duration_ms)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to record history for unit {}", new.unit_name))?;

    Ok(history)
}

/// List history rows for a task, newest first.
pub async fn list_histories(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskUnitHistory>> {
    let histories = sqlx::query_as::<_, TaskUnitHistory>(
        "SELECT * FROM task_unit_histories WHERE task_id = $1 ORDER BY completed_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list unit histories")?;

    Ok(histories)
}

/// Delete history rows whose unit name or pattern matches a search pattern
/// (SQL LIKE syntax). Returns the number of rows deleted.
pub async fn clear_by_pattern(pool: &PgPool, task_id: Uuid, pattern: &str) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM task_unit_histories \
         WHERE task_id = $1 AND (unit_name LIKE $2 OR pattern LIKE $2)",
    )
    .bind(task_id)
    .bind(pattern)
    .execute(pool)
    .await
    .context("failed to clear unit histories by pattern")?;

    Ok(result.rows_affected())
}
