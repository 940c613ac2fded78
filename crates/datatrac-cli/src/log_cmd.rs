//! `datatrac log` command: show recent log entries and unit history for a
//! task.

use anyhow::{Context, Result};
use sqlx::PgPool;

use datatrac_core::SyncEngine;
use datatrac_db::queries::tasks as task_db;
use datatrac_db::queries::unit_histories;

use crate::task_cmds::resolve_task_id;

/// Run the log command.
///
/// The in-memory ring only covers the current process, so a CLI invocation
/// mostly sees history rows; `--limit` bounds both listings.
pub async fn run_log(
    pool: &PgPool,
    engine: &SyncEngine,
    task: &str,
    limit: usize,
) -> Result<()> {
    let task_id = resolve_task_id(pool, task).await?;
    let task = task_db::get_task(pool, task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;

    println!("Task: {} ({})", task.name, task.id);
    println!("Status: {}", task.status);
    println!();

    let entries = engine.logs().recent(task_id, limit);
    if entries.is_empty() {
        println!("No log entries in this process.");
    } else {
        println!("Recent log entries ({}):", entries.len());
        for entry in &entries {
            let time = entry.timestamp.format("%H:%M:%S%.3f");
            println!("  [{time}] {:?}/{:?}: {}", entry.level, entry.category, entry.message);
        }
    }
    println!();

    let histories = unit_histories::list_histories(pool, task_id).await?;
    if histories.is_empty() {
        println!("No completed-unit history.");
        return Ok(());
    }
    println!("History ({} most recent of {}):", histories.len().min(limit), histories.len());
    for row in histories.iter().take(limit) {
        println!(
            "  [{}] {} ({}) {} records in {} ms",
            row.completed_at.format("%Y-%m-%d %H:%M:%S"),
            row.unit_name,
            row.pattern,
            row.total_records,
            row.duration_ms,
        );
    }
    Ok(())
}
