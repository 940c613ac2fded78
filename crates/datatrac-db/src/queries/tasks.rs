//! Database query functions for the `sync_tasks` table, including the
//! `is_running` claim that guards concurrent starts.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{EngineKind, SyncMode, SyncTask, TaskStatus};

/// Parameters for inserting a new sync task row.
#[derive(Debug, Clone)]
pub struct NewSyncTask<'a> {
    pub name: &'a str,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub source_kind: EngineKind,
    pub target_kind: EngineKind,
    pub config: &'a str,
    pub mode: SyncMode,
}

/// Insert a new sync task row in status `idle`. Returns the inserted task
/// with server-generated defaults (id, status, timestamps).
pub async fn insert_task(pool: &PgPool, new: &NewSyncTask<'_>) -> Result<SyncTask> {
    let task = sqlx::query_as::<_, SyncTask>(
        "INSERT INTO sync_tasks (name, source_id, target_id, source_kind, target_kind, config, mode) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.name)
    .bind(new.source_id)
    .bind(new.target_id)
    .bind(new.source_kind)
    .bind(new.target_kind)
    .bind(new.config)
    .bind(new.mode)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert sync task {}", new.name))?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<SyncTask>> {
    let task = sqlx::query_as::<_, SyncTask>("SELECT * FROM sync_tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch sync task")?;

    Ok(task)
}

/// Fetch a single task by name.
pub async fn get_task_by_name(pool: &PgPool, name: &str) -> Result<Option<SyncTask>> {
    let task = sqlx::query_as::<_, SyncTask>("SELECT * FROM sync_tasks WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch sync task by name")?;

    Ok(task)
}

/// List all tasks, ordered by creation time.
pub async fn list_tasks(pool: &PgPool) -> Result<Vec<SyncTask>> {
    let tasks =
        sqlx::query_as::<_, SyncTask>("SELECT * FROM sync_tasks ORDER BY created_at ASC")
            .fetch_all(pool)
            .await
            .context("failed to list sync tasks")?;

    Ok(tasks)
}

/// Update the lifecycle status of a task.
pub async fn update_task_status(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<()> {
    let result =
        sqlx::query("UPDATE sync_tasks SET status = $1, updated_at = NOW() WHERE id = $2")
            .bind(status)
            .bind(id)
            .execute(pool)
            .await
            .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("sync task {id} not found");
    }

    Ok(())
}

/// Replace the task's config blob and move it to `configured`.
pub async fn update_task_config(pool: &PgPool, id: Uuid, config: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE sync_tasks SET config = $1, status = 'configured', updated_at = NOW() \
         WHERE id = $2",
    )
    .bind(config)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task config")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("sync task {id} not found");
    }

    Ok(())
}

/// Claim the `is_running` flag for a task.
///
/// Uses optimistic locking: the UPDATE only succeeds when the flag is
/// currently clear, so exactly one caller wins a concurrent start. Returns
/// the number of rows affected (0 means the task was already running or
/// does not exist).
pub async fn claim_running(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sync_tasks \
         SET is_running = TRUE, status = 'running', updated_at = NOW() \
         WHERE id = $1 AND is_running = FALSE",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to claim is_running")?;

    Ok(result.rows_affected())
}

/// Clear the `is_running` flag and set the task's terminal (or resumable)
/// status in one statement.
pub async fn release_running(pool: &PgPool, id: Uuid, status: TaskStatus) -> Result<()> {
    sqlx::query(
        "UPDATE sync_tasks \
         SET is_running = FALSE, status = $1, updated_at = NOW() \
         WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to release is_running")?;

    Ok(())
}

/// Read just the `is_running` flag. The periodic progress pusher consults
/// this before each push.
pub async fn is_running(pool: &PgPool, id: Uuid) -> Result<bool> {
    let row: Option<(bool,)> =
        sqlx::query_as("SELECT is_running FROM sync_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to read is_running")?;

    Ok(row.map(|(f,)| f).unwrap_or(false))
}

/// Delete a task. Unit configs, runtimes, and histories cascade.
pub async fn delete_task(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sync_tasks WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete sync task")?;

    Ok(result.rows_affected())
}
