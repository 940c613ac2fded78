//! Database query functions for the `task_unit_configs` table (intent rows).

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskUnitConfig, UnitKind};

/// Insert one unit config. Idempotent per `(task_id, unit_name)`.
pub async fn insert_unit_config(
    pool: &PgPool,
    task_id: Uuid,
    unit_name: &str,
    unit_kind: UnitKind,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_unit_configs (task_id, unit_name, unit_kind) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (task_id, unit_name) DO NOTHING",
    )
    .bind(task_id)
    .bind(unit_name)
    .bind(unit_kind)
    .execute(pool)
    .await
    .with_context(|| format!("failed to insert unit config {unit_name}"))?;

    Ok(())
}

/// List all unit configs for a task, ordered by unit name.
pub async fn list_unit_configs(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskUnitConfig>> {
    let configs = sqlx::query_as::<_, TaskUnitConfig>(
        "SELECT * FROM task_unit_configs WHERE task_id = $1 ORDER BY unit_name ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list unit configs")?;

    Ok(configs)
}

/// Delete all unit configs for a task (used when the task is reconfigured).
pub async fn delete_unit_configs(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM task_unit_configs WHERE task_id = $1")
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to delete unit configs")?;

    Ok(result.rows_affected())
}
