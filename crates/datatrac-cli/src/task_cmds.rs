//! `datatrac task` commands: create, show, and delete sync tasks.

use anyhow::{Context, Result, bail};
use sqlx::PgPool;
use uuid::Uuid;

use datatrac_core::taskconfig::TaskConfig;
use datatrac_db::models::SyncMode;
use datatrac_db::queries::data_sources as source_db;
use datatrac_db::queries::tasks as task_db;
use datatrac_db::queries::unit_configs as config_db;

/// Create a task from a JSON config file and materialize its unit configs.
///
/// The task lands in `configured`, ready to start.
pub async fn run_create(
    pool: &PgPool,
    name: &str,
    source_name: &str,
    target_name: &str,
    config_path: &str,
    mode: &str,
) -> Result<()> {
    let mode: SyncMode = mode
        .parse()
        .map_err(|e| anyhow::anyhow!("{e} (expected full or incremental)"))?;

    let source = source_db::get_data_source_by_name(pool, source_name)
        .await?
        .with_context(|| format!("source data source {source_name:?} not found"))?;
    let target = source_db::get_data_source_by_name(pool, target_name)
        .await?
        .with_context(|| format!("target data source {target_name:?} not found"))?;

    if source.id == target.id {
        bail!("source and target must be different data sources");
    }
    if task_db::get_task_by_name(pool, name).await?.is_some() {
        bail!("task {name:?} already exists");
    }

    let blob = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config file {config_path}"))?;
    let config =
        TaskConfig::parse(&blob).map_err(|e| anyhow::anyhow!("invalid task config: {e}"))?;

    let plans = config.unit_plans();
    if plans.is_empty() {
        bail!("config selects no tables and no indices");
    }

    let task = task_db::insert_task(
        pool,
        &task_db::NewSyncTask {
            name,
            source_id: source.id,
            target_id: target.id,
            source_kind: source.kind,
            target_kind: target.kind,
            config: &blob,
            mode,
        },
    )
    .await?;

    for plan in &plans {
        config_db::insert_unit_config(pool, task.id, &plan.unit_name, plan.kind).await?;
    }
    task_db::update_task_config(pool, task.id, &blob).await?;

    println!("Task created: {} ({})", task.name, task.id);
    println!("  {} -> {}, {} unit(s), mode {}", source.name, target.name, plans.len(), mode);
    Ok(())
}

/// Show one task, or list all tasks when no ID is given.
pub async fn run_show(pool: &PgPool, task_id_str: Option<&str>) -> Result<()> {
    match task_id_str {
        Some(id_str) => {
            let task_id = resolve_task_id(pool, id_str).await?;
            let task = task_db::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            let units = config_db::list_unit_configs(pool, task_id).await?;

            println!("Task: {} ({})", task.name, task.id);
            println!("Status: {} (is_running={})", task.status, task.is_running);
            println!("Mode: {}", task.mode);
            println!("Units ({}):", units.len());
            for unit in &units {
                println!("  [{}] {}", unit.unit_kind, unit.unit_name);
            }
        }
        None => {
            let tasks = task_db::list_tasks(pool).await?;
            if tasks.is_empty() {
                println!("No tasks defined.");
                return Ok(());
            }
            println!("Tasks ({}):", tasks.len());
            for task in &tasks {
                println!("  {} [{}] ({})", task.name, task.status, task.id);
            }
        }
    }
    Ok(())
}

/// Delete a task and its unit rows (cascade).
pub async fn run_delete(pool: &PgPool, task_id_str: &str) -> Result<()> {
    let task_id = resolve_task_id(pool, task_id_str).await?;
    let deleted = task_db::delete_task(pool, task_id).await?;
    if deleted == 0 {
        bail!("task {task_id} not found");
    }
    println!("Task {task_id} deleted.");
    Ok(())
}

/// Accept either a task UUID or a task name.
pub async fn resolve_task_id(pool: &PgPool, id_or_name: &str) -> Result<Uuid> {
    if let Ok(id) = Uuid::parse_str(id_or_name) {
        return Ok(id);
    }
    let task = task_db::get_task_by_name(pool, id_or_name)
        .await?
        .with_context(|| format!("no task named {id_or_name:?}"))?;
    Ok(task.id)
}
