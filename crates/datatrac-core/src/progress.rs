//! Progress snapshot assembly.
//!
//! Snapshots are always re-read from the checkpoint store; nothing here
//! accumulates in memory, so a snapshot is correct even after a restart.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use datatrac_db::queries::tasks as task_db;
use datatrac_db::queries::unit_runtimes as runtime_db;

use crate::events::{ProgressSnapshot, UnitSnapshot};

/// Build the current per-task snapshot: aggregate counters plus the
/// per-unit array.
pub async fn snapshot(pool: &PgPool, task_id: Uuid) -> Result<ProgressSnapshot> {
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    let progress = runtime_db::get_unit_progress(pool, task_id).await?;
    let runtimes = runtime_db::list_runtimes(pool, task_id).await?;

    let units = runtimes
        .into_iter()
        .map(|r| UnitSnapshot {
            unit_name: r.unit_name,
            status: r.status,
            total_records: r.total_records,
            processed_records: r.processed_records,
            error_message: r.error_message,
        })
        .collect();

    Ok(ProgressSnapshot {
        task_id,
        status: task.status,
        is_running: task.is_running,
        total_units: progress.total_units,
        pending: progress.pending,
        running: progress.running,
        completed: progress.completed,
        failed: progress.failed,
        paused: progress.paused,
        total_records: progress.total_records,
        processed_records: progress.processed_records,
        units,
    })
}
