mod config;
mod log_cmd;
mod serve_cmd;
mod source_cmds;
mod status_cmd;
mod task_cmds;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use datatrac_core::SyncEngine;
use datatrac_core::adapter::ConnectFactory;
use datatrac_db::pool;

use config::DatatracConfig;

#[derive(Parser)]
#[command(name = "datatrac", about = "Cross-store data synchronization service")]
struct Cli {
    /// Database URL (overrides DATATRAC_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a datatrac config file (no database required)
    Init {
        /// PostgreSQL connection URL for the checkpoint store
        #[arg(long, default_value = "postgresql://localhost:5432/datatrac")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the datatrac database (requires config file or env vars)
    DbInit,
    /// Data-source management
    Source {
        #[command(subcommand)]
        command: SourceCommands,
    },
    /// Task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Start a task and wait for it to finish, pause, or fail
    Start {
        /// Task ID or name
        task: String,
        /// Return immediately instead of waiting for the run to finish
        #[arg(long)]
        detach: bool,
    },
    /// Pause a running task (progress is kept)
    Pause {
        /// Task ID or name
        task: String,
    },
    /// Stop a task and abandon all progress
    Stop {
        /// Task ID or name
        task: String,
    },
    /// Show task progress (omit task to list all tasks)
    Status {
        /// Task ID or name (omit to list all tasks)
        task: Option<String>,
    },
    /// Show recent log entries and unit history for a task
    Log {
        /// Task ID or name
        task: String,
        /// Maximum entries to show
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Reset all failed units of a task back to pending
    ResetFailed {
        /// Task ID or name
        task: String,
    },
    /// Force a single unit runtime back to pending
    ResetUnit {
        /// Unit runtime ID
        unit_id: String,
    },
    /// Delete completed-unit history rows matching a pattern (SQL LIKE)
    ClearHistory {
        /// Task ID or name
        task: String,
        /// Pattern matched against unit name and selection pattern
        pattern: String,
    },
    /// Run the HTTP control API and SSE event stream
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8472)]
        port: u16,
    },
}

#[derive(Subcommand)]
pub enum SourceCommands {
    /// Add a data source
    Add {
        /// Unique data source name
        name: String,
        /// Engine kind: sql or doc
        #[arg(long)]
        kind: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        port: i32,
        #[arg(long)]
        username: String,
        /// Password; sealed before it reaches the database
        #[arg(long)]
        password: String,
        /// Default schema for SQL engines
        #[arg(long)]
        schema: Option<String>,
    },
    /// List data sources
    List,
    /// Remove a data source by name
    Remove {
        /// Data source name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task from a JSON config file
    Create {
        /// Unique task name
        name: String,
        /// Source data source name
        #[arg(long)]
        source: String,
        /// Target data source name
        #[arg(long)]
        target: String,
        /// Path to the JSON task config
        #[arg(long)]
        config: String,
        /// Sync mode: full or incremental
        #[arg(long, default_value = "full")]
        mode: String,
    },
    /// Show task details (omit to list all tasks)
    Show {
        /// Task ID or name (omit to list all)
        task: Option<String>,
    },
    /// Delete a task and its unit rows
    Delete {
        /// Task ID or name
        task: String,
    },
}

/// Execute the `datatrac init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let key = config::generate_secret_key();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        secrets: config::SecretsSection { key: key.clone() },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  secrets.key = {}...{}", &key[..8], &key[56..]);
    println!();
    println!("Next: run `datatrac db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `datatrac db-init` command: create database and run
/// migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DatatracConfig::resolve(cli_db_url)?;

    println!("Initializing datatrac database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;
    db_pool.close().await;

    println!("datatrac db-init complete.");
    Ok(())
}

fn build_engine(pool: sqlx::PgPool, config: &DatatracConfig) -> Arc<SyncEngine> {
    let factory = Arc::new(ConnectFactory::new(config.secret_key.clone()));
    Arc::new(SyncEngine::new(pool, factory))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Source { command } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                SourceCommands::Add {
                    name,
                    kind,
                    host,
                    port,
                    username,
                    password,
                    schema,
                } => {
                    source_cmds::run_add(
                        &db_pool,
                        &resolved.secret_key,
                        &name,
                        &kind,
                        &host,
                        port,
                        &username,
                        &password,
                        schema.as_deref(),
                    )
                    .await
                }
                SourceCommands::List => source_cmds::run_list(&db_pool).await,
                SourceCommands::Remove { name } => source_cmds::run_remove(&db_pool, &name).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Task { command } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = match command {
                TaskCommands::Create {
                    name,
                    source,
                    target,
                    config,
                    mode,
                } => {
                    task_cmds::run_create(&db_pool, &name, &source, &target, &config, &mode).await
                }
                TaskCommands::Show { task } => task_cmds::run_show(&db_pool, task.as_deref()).await,
                TaskCommands::Delete { task } => task_cmds::run_delete(&db_pool, &task).await,
            };
            db_pool.close().await;
            result?;
        }
        Commands::Start { task, detach } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let task_id = task_cmds::resolve_task_id(&db_pool, &task).await?;
            let engine = build_engine(db_pool.clone(), &resolved);

            engine
                .start(task_id)
                .await
                .with_context(|| format!("failed to start task {task}"))?;
            println!("Task {task} started.");

            if !detach {
                engine.wait_until_idle(task_id).await;
                status_cmd::run_status(&db_pool, Some(&task_id.to_string())).await?;
            }
            db_pool.close().await;
        }
        Commands::Pause { task } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let task_id = task_cmds::resolve_task_id(&db_pool, &task).await?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = engine.pause(task_id).await;
            db_pool.close().await;
            result.with_context(|| format!("failed to pause task {task}"))?;
            println!("Task {task} paused.");
        }
        Commands::Stop { task } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let task_id = task_cmds::resolve_task_id(&db_pool, &task).await?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = engine.stop(task_id).await;
            db_pool.close().await;
            result.with_context(|| format!("failed to stop task {task}"))?;
            println!("Task {task} stopped; progress abandoned.");
        }
        Commands::Status { task } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, task.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Log { task, limit } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = log_cmd::run_log(&db_pool, &engine, &task, limit).await;
            db_pool.close().await;
            result?;
        }
        Commands::ResetFailed { task } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let task_id = task_cmds::resolve_task_id(&db_pool, &task).await?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = engine.reset_failed(task_id).await;
            db_pool.close().await;
            let reset = result.with_context(|| format!("failed to reset task {task}"))?;
            println!("{reset} unit(s) reset to pending.");
        }
        Commands::ResetUnit { unit_id } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let id = uuid::Uuid::parse_str(&unit_id)
                .with_context(|| format!("invalid unit ID: {unit_id}"))?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = engine.reset_unit(id).await;
            db_pool.close().await;
            result.with_context(|| format!("failed to reset unit {unit_id}"))?;
            println!("Unit {unit_id} reset to pending.");
        }
        Commands::ClearHistory { task, pattern } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let task_id = task_cmds::resolve_task_id(&db_pool, &task).await?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = engine.clear_by_pattern(task_id, &pattern).await;
            db_pool.close().await;
            let deleted = result.with_context(|| format!("failed to clear history for {task}"))?;
            println!("{deleted} history row(s) deleted.");
        }
        Commands::Serve { bind, port } => {
            let resolved = DatatracConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let engine = build_engine(db_pool.clone(), &resolved);
            let result = serve_cmd::run_serve(engine, &bind, port).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
