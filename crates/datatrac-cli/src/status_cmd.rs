//! `datatrac status` command: show task progress and per-unit status.

use anyhow::{Context, Result};
use sqlx::PgPool;

use datatrac_db::queries::tasks as task_db;
use datatrac_db::queries::unit_runtimes as runtime_db;

use crate::task_cmds::resolve_task_id;

/// Run the status command.
///
/// When `task` is `Some`, shows detailed status for that task. When `None`,
/// lists all tasks with a progress summary.
pub async fn run_status(pool: &PgPool, task: Option<&str>) -> Result<()> {
    match task {
        Some(id_str) => run_task_status(pool, id_str).await,
        None => run_overview(pool).await,
    }
}

/// Show detailed status for a single task.
async fn run_task_status(pool: &PgPool, id_str: &str) -> Result<()> {
    let task_id = resolve_task_id(pool, id_str).await?;
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.name, task.id);
    println!("Status: {} (is_running={})", task.status, task.is_running);
    println!("Mode: {}", task.mode);
    println!();

    let progress = runtime_db::get_unit_progress(pool, task_id).await?;
    println!(
        "Progress: {}/{} units completed, {}/{} records",
        progress.completed,
        progress.total_units,
        progress.processed_records,
        progress.total_records,
    );
    println!(
        "  pending={} running={} completed={} failed={} paused={}",
        progress.pending, progress.running, progress.completed, progress.failed, progress.paused,
    );
    println!();

    let runtimes = runtime_db::list_runtimes(pool, task_id).await?;
    if runtimes.is_empty() {
        println!("No unit runtimes yet (task has not started).");
        return Ok(());
    }
    println!("Units:");
    for unit in &runtimes {
        let error = unit
            .error_message
            .as_deref()
            .map(|e| format!(" ({e})"))
            .unwrap_or_default();
        println!(
            "  [{:<9}] {} {}/{}{error}",
            unit.status.to_string(),
            unit.unit_name,
            unit.processed_records,
            unit.total_records,
        );
    }
    Ok(())
}

/// List all tasks with a one-line summary each.
async fn run_overview(pool: &PgPool) -> Result<()> {
    let tasks = task_db::list_tasks(pool).await?;
    if tasks.is_empty() {
        println!("No tasks defined.");
        return Ok(());
    }

    println!("Tasks ({}):", tasks.len());
    for task in &tasks {
        let progress = runtime_db::get_unit_progress(pool, task.id).await?;
        println!(
            "  {} [{}] {}/{} units, {}/{} records ({})",
            task.name,
            task.status,
            progress.completed,
            progress.total_units,
            progress.processed_records,
            progress.total_records,
            task.id,
        );
    }
    Ok(())
}
