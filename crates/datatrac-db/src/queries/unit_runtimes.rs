//! Database query functions for the `task_unit_runtimes` table.
//!
//! Runtime rows are the canonical progress record. Every mutation here is a
//! single-statement transaction; status transitions use optimistic locking
//! on the expected current status so a stale caller cannot clobber a row it
//! no longer owns.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskUnitRuntime, UnitStatus};

/// Materialize one `pending` runtime row per unit config.
///
/// Idempotent: rows that already exist are left untouched, so calling this
/// on a partially-run task preserves progress.
pub async fn materialize_runtimes(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO task_unit_runtimes (task_id, unit_name) \
         SELECT task_id, unit_name FROM task_unit_configs WHERE task_id = $1 \
         ON CONFLICT (task_id, unit_name) DO NOTHING",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to materialize unit runtimes")?;

    Ok(result.rows_affected())
}

/// Fetch a single runtime row by ID.
pub async fn get_runtime(pool: &PgPool, id: Uuid) -> Result<Option<TaskUnitRuntime>> {
    let runtime =
        sqlx::query_as::<_, TaskUnitRuntime>("SELECT * FROM task_unit_runtimes WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch unit runtime")?;

    Ok(runtime)
}

/// List all runtime rows for a task, ordered by unit name.
pub async fn list_runtimes(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskUnitRuntime>> {
    let runtimes = sqlx::query_as::<_, TaskUnitRuntime>(
        "SELECT * FROM task_unit_runtimes WHERE task_id = $1 ORDER BY unit_name ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list unit runtimes")?;

    Ok(runtimes)
}

/// List the units that still need work: `pending` plus `failed`.
pub async fn list_pending(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskUnitRuntime>> {
    let runtimes = sqlx::query_as::<_, TaskUnitRuntime>(
        "SELECT * FROM task_unit_runtimes \
         WHERE task_id = $1 AND status IN ('pending', 'failed') \
         ORDER BY unit_name ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending unit runtimes")?;

    Ok(runtimes)
}

/// List failed units with their error messages, newest first.
pub async fn list_failed(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskUnitRuntime>> {
    let runtimes = sqlx::query_as::<_, TaskUnitRuntime>(
        "SELECT * FROM task_unit_runtimes \
         WHERE task_id = $1 AND status = 'failed' \
         ORDER BY updated_at DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list failed unit runtimes")?;

    Ok(runtimes)
}

/// Bulk status reset with counter clearing.
///
/// Moves every runtime whose status is in `from` back to `pending` and
/// zeroes the counters, error message, start timestamp, and batch index.
/// Returns the number of rows reset.
pub async fn reset_runtimes(
    pool: &PgPool,
    task_id: Uuid,
    from: &[UnitStatus],
) -> Result<u64> {
    let from_strs: Vec<String> = from.iter().map(|s| s.to_string()).collect();
    let result = sqlx::query(
        "UPDATE task_unit_runtimes \
         SET status = 'pending', \
             total_records = 0, \
             processed_records = 0, \
             error_message = NULL, \
             started_at = NULL, \
             last_batch_index = 0, \
             updated_at = NOW() \
         WHERE task_id = $1 AND status = ANY($2)",
    )
    .bind(task_id)
    .bind(&from_strs)
    .execute(pool)
    .await
    .context("failed to reset unit runtimes")?;

    Ok(result.rows_affected())
}

/// Upgrade `paused` and `failed` runtimes back to `pending`, keeping the
/// progress counters so a paused unit resumes where it left off. Failed
/// units get their error message cleared.
pub async fn revive_runtimes(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_unit_runtimes \
         SET status = 'pending', error_message = NULL, updated_at = NOW() \
         WHERE task_id = $1 AND status IN ('paused', 'failed')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to revive unit runtimes")?;

    Ok(result.rows_affected())
}

/// Zero the progress counters of one runtime without touching its status.
///
/// Used when a resumed unit cannot continue from its old position (scroll
/// cursors are not replayable) and the scan restarts from the beginning.
pub async fn clear_progress(pool: &PgPool, unit_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE task_unit_runtimes \
         SET processed_records = 0, last_batch_index = 0, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to clear unit progress")?;

    Ok(())
}

/// Force a single runtime back to `pending` with cleared counters.
pub async fn reset_unit(pool: &PgPool, unit_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_unit_runtimes \
         SET status = 'pending', \
             total_records = 0, \
             processed_records = 0, \
             error_message = NULL, \
             started_at = NULL, \
             last_batch_index = 0, \
             updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to reset unit runtime")?;

    Ok(result.rows_affected())
}

/// Transition `pending -> running`, recording `started_at`.
///
/// Optimistically locked on the current status; returns rows affected.
pub async fn begin_unit(pool: &PgPool, unit_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_unit_runtimes \
         SET status = 'running', started_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND status = 'pending'",
    )
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to begin unit")?;

    Ok(result.rows_affected())
}

/// Persist the total record count captured from the source.
pub async fn set_total_records(pool: &PgPool, unit_id: Uuid, total: i64) -> Result<()> {
    sqlx::query(
        "UPDATE task_unit_runtimes SET total_records = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(total)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to set total records")?;

    Ok(())
}

/// Advance the progress counter after a committed batch.
///
/// `processed_records` only ever grows here, so the on-disk counter stays
/// monotonic within a run.
pub async fn advance_progress(
    pool: &PgPool,
    unit_id: Uuid,
    delta: i64,
    batch_index: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE task_unit_runtimes \
         SET processed_records = processed_records + $1, \
             last_batch_index = $2, \
             updated_at = NOW() \
         WHERE id = $3",
    )
    .bind(delta)
    .bind(batch_index)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to advance unit progress")?;

    Ok(())
}

/// Transition `running -> completed`.
///
/// With `align_counters`, `processed_records` is set to `total_records`
/// (clean drain). Runs that skipped batches keep the accumulated counter so
/// it reflects what was actually written.
pub async fn complete_unit(pool: &PgPool, unit_id: Uuid, align_counters: bool) -> Result<u64> {
    let sql = if align_counters {
        "UPDATE task_unit_runtimes \
         SET status = 'completed', processed_records = total_records, updated_at = NOW() \
         WHERE id = $1 AND status = 'running'"
    } else {
        "UPDATE task_unit_runtimes \
         SET status = 'completed', updated_at = NOW() \
         WHERE id = $1 AND status = 'running'"
    };
    let result = sqlx::query(sql)
        .bind(unit_id)
        .execute(pool)
        .await
        .context("failed to complete unit")?;

    Ok(result.rows_affected())
}

/// Transition `running -> failed` with an error message.
///
/// Also accepts `pending` so a unit that fails before it ever starts (e.g.
/// a missing config mapping) still records the failure.
pub async fn fail_unit(pool: &PgPool, unit_id: Uuid, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_unit_runtimes \
         SET status = 'failed', error_message = $1, updated_at = NOW() \
         WHERE id = $2 AND status IN ('pending', 'running')",
    )
    .bind(error)
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to fail unit")?;

    Ok(result.rows_affected())
}

/// Transition `running -> paused` (cancellation observed between batches).
pub async fn pause_unit(pool: &PgPool, unit_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_unit_runtimes \
         SET status = 'paused', updated_at = NOW() \
         WHERE id = $1 AND status = 'running'",
    )
    .bind(unit_id)
    .execute(pool)
    .await
    .context("failed to pause unit")?;

    Ok(result.rows_affected())
}

/// Status counts plus aggregate record counters for a task's units.
#[derive(Debug, Clone, Default)]
pub struct UnitProgress {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub paused: i64,
    pub total_units: i64,
    pub total_records: i64,
    pub processed_records: i64,
}

/// Get a summary of unit counts by status for a task.
pub async fn get_unit_progress(pool: &PgPool, task_id: Uuid) -> Result<UnitProgress> {
    let rows: Vec<(String, i64, i64, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*), \
                COALESCE(SUM(total_records), 0)::bigint, \
                COALESCE(SUM(processed_records), 0)::bigint \
         FROM task_unit_runtimes \
         WHERE task_id = $1 \
         GROUP BY status",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get unit progress")?;

    let mut progress = UnitProgress::default();
    for (status, count, total, processed) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "running" => progress.running = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "paused" => progress.paused = *count,
            _ => {}
        }
        progress.total_units += count;
        progress.total_records += total;
        progress.processed_records += processed;
    }
    Ok(progress)
}

/// Check whether every runtime for a task has status `completed`.
///
/// Returns `false` when the task has no runtime rows at all.
pub async fn all_completed(pool: &PgPool, task_id: Uuid) -> Result<bool> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'completed') \
         FROM task_unit_runtimes WHERE task_id = $1",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check unit completion")?;

    Ok(row.0 > 0 && row.0 == row.1)
}
