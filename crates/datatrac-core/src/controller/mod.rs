//! The task controller: start/pause/stop orchestration, worker-pool
//! lifecycle, and the admin/query surface of the control API.

mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use datatrac_db::models::{DataSource, SyncMode, SyncTask, TaskStatus, TaskUnitRuntime, UnitStatus};
use datatrac_db::queries::tasks as task_db;
use datatrac_db::queries::unit_histories;
use datatrac_db::queries::unit_runtimes as runtime_db;
use datatrac_db::queries::data_sources as source_db;

use crate::adapter::AdapterFactory;
use crate::error::ControlError;
use crate::events::{ErrorRecord, EventBus, ProgressSnapshot, SyncEvent};
use crate::logbuf::{LogCategory, LogEntry, LogHub, LogLevel};
use crate::pipeline::PipelineCtx;
use crate::progress;
use crate::taskconfig::{ErrorPolicy, TaskConfig};

/// Interval between periodic progress pushes while a task is running.
const PROGRESS_PUSH_INTERVAL: Duration = Duration::from_secs(2);

/// In-process handle to a started task's worker pool.
#[derive(Clone)]
struct ExecutionHandle {
    cancel: CancellationToken,
    /// Flips to `true` after the monitor has cleared `is_running`.
    done: watch::Receiver<bool>,
}

/// Per-unit breakdown returned by [`SyncEngine::get_task_units`].
#[derive(Debug, Serialize)]
pub struct UnitsReport {
    /// Units still in play: pending, running, paused, or failed.
    pub active: Vec<TaskUnitRuntime>,
    pub completed: Vec<TaskUnitRuntime>,
    pub statistics: UnitStatistics,
}

/// Aggregate unit counters.
#[derive(Debug, Default, Serialize)]
pub struct UnitStatistics {
    pub total_units: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub paused: i64,
    pub total_records: i64,
    pub processed_records: i64,
}

/// The sync execution engine. One instance per process; cheap to share
/// behind an `Arc`.
pub struct SyncEngine {
    pool: PgPool,
    bus: Arc<EventBus>,
    logs: Arc<LogHub>,
    factory: Arc<dyn AdapterFactory>,
    executions: Arc<StdMutex<HashMap<Uuid, ExecutionHandle>>>,
}

impl SyncEngine {
    pub fn new(pool: PgPool, factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            pool,
            bus: Arc::new(EventBus::default()),
            logs: Arc::new(LogHub::default()),
            factory,
            executions: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn logs(&self) -> &Arc<LogHub> {
        &self.logs
    }

    /// Whether this process currently holds a live execution for the task.
    pub fn has_execution(&self, task_id: Uuid) -> bool {
        self.executions
            .lock()
            .expect("execution map lock poisoned")
            .contains_key(&task_id)
    }

    // -----------------------------------------------------------------
    // start / pause / stop
    // -----------------------------------------------------------------

    /// Start a task: materialize or revive its unit runtimes, claim the
    /// `is_running` flag, and spawn the worker pool.
    pub async fn start(&self, task_id: Uuid) -> Result<(), ControlError> {
        let task = self.load_task(task_id).await?;

        match task.status {
            TaskStatus::Idle => {
                return Err(ControlError::InvalidState(format!(
                    "task {task_id} has not been configured"
                )));
            }
            TaskStatus::Running => {
                return Err(ControlError::InvalidState(format!(
                    "task {task_id} is already running"
                )));
            }
            _ => {}
        }
        if task.is_running || self.has_execution(task_id) {
            return Err(ControlError::InvalidState(format!(
                "task {task_id} is already running"
            )));
        }

        // 1. Parse the config; reject if malformed.
        let config = Arc::new(TaskConfig::parse(&task.config)?);

        // Validate the endpoints the way the task wizard promised them.
        let (source, target) = self.load_endpoints(&task).await?;

        // 2/3. Repeat-run reset, or revive paused/failed rows; then
        // materialize any missing rows.
        let runtimes = runtime_db::list_runtimes(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;
        let all_completed =
            !runtimes.is_empty() && runtimes.iter().all(|r| r.status == UnitStatus::Completed);
        if all_completed {
            runtime_db::reset_runtimes(&self.pool, task_id, &[UnitStatus::Completed])
                .await
                .map_err(ControlError::Storage)?;
        } else {
            runtime_db::revive_runtimes(&self.pool, task_id)
                .await
                .map_err(ControlError::Storage)?;
        }
        runtime_db::materialize_runtimes(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;

        // 4. Load the work list; fail fast when there is nothing to do.
        let pending = runtime_db::list_pending(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;
        if pending.is_empty() {
            return Err(ControlError::NoWork(task_id));
        }

        // 5. Claim the running flag atomically.
        let claimed = task_db::claim_running(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;
        if claimed == 0 {
            return Err(ControlError::InvalidState(format!(
                "task {task_id} is already running"
            )));
        }

        // 6. Queue + workers + monitor.
        self.spawn_execution(Arc::new(task), config, source, target, pending);

        Ok(())
    }

    /// Wait until the task's execution (if any) has fully wound down.
    ///
    /// Returns immediately when this process holds no execution for the
    /// task. Useful for CLI runs that start a task and want to block until
    /// the terminal status is decided.
    pub async fn wait_until_idle(&self, task_id: Uuid) {
        let handle = {
            let executions = self.executions.lock().expect("execution map lock poisoned");
            executions.get(&task_id).cloned()
        };
        if let Some(handle) = handle {
            wait_done(handle.done).await;
        }
    }

    /// Pause a running task: fire the cancellation signal and wait until
    /// every worker has returned and `is_running` is cleared.
    pub async fn pause(&self, task_id: Uuid) -> Result<(), ControlError> {
        self.load_task(task_id).await?;

        let handle = {
            let executions = self.executions.lock().expect("execution map lock poisoned");
            executions.get(&task_id).cloned()
        };
        let Some(handle) = handle else {
            return Err(ControlError::NotRunning(task_id));
        };

        handle.cancel.cancel();
        wait_done(handle.done).await;
        Ok(())
    }

    /// Stop a task: pause if running, then abandon all progress by
    /// resetting every runtime to `pending` with cleared counters.
    pub async fn stop(&self, task_id: Uuid) -> Result<(), ControlError> {
        self.load_task(task_id).await?;

        let handle = {
            let executions = self.executions.lock().expect("execution map lock poisoned");
            executions.get(&task_id).cloned()
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            wait_done(handle.done).await;
        }

        runtime_db::reset_runtimes(
            &self.pool,
            task_id,
            &[
                UnitStatus::Pending,
                UnitStatus::Running,
                UnitStatus::Completed,
                UnitStatus::Failed,
                UnitStatus::Paused,
            ],
        )
        .await
        .map_err(ControlError::Storage)?;

        task_db::update_task_status(&self.pool, task_id, TaskStatus::Configured)
            .await
            .map_err(ControlError::Storage)?;

        self.log(task_id, LogLevel::Info, LogCategory::All, "task stopped, progress abandoned");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------

    pub async fn get_progress(&self, task_id: Uuid) -> Result<ProgressSnapshot, ControlError> {
        self.load_task(task_id).await?;
        progress::snapshot(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)
    }

    pub async fn get_task_units(&self, task_id: Uuid) -> Result<UnitsReport, ControlError> {
        self.load_task(task_id).await?;

        let runtimes = runtime_db::list_runtimes(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;
        let progress = runtime_db::get_unit_progress(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;

        let (completed, active): (Vec<_>, Vec<_>) = runtimes
            .into_iter()
            .partition(|r| r.status == UnitStatus::Completed);

        Ok(UnitsReport {
            active,
            completed,
            statistics: UnitStatistics {
                total_units: progress.total_units,
                pending: progress.pending,
                running: progress.running,
                completed: progress.completed,
                failed: progress.failed,
                paused: progress.paused,
                total_records: progress.total_records,
                processed_records: progress.processed_records,
            },
        })
    }

    pub async fn get_errors(&self, task_id: Uuid) -> Result<Vec<ErrorRecord>, ControlError> {
        self.load_task(task_id).await?;

        let failed = runtime_db::list_failed(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?;
        Ok(failed
            .into_iter()
            .map(|unit| ErrorRecord {
                message: unit
                    .error_message
                    .unwrap_or_else(|| "unknown failure".to_owned()),
                unit_name: Some(unit.unit_name),
                at: unit.updated_at,
            })
            .collect())
    }

    pub async fn get_logs(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<LogEntry>, ControlError> {
        self.load_task(task_id).await?;
        Ok(self.logs.recent(task_id, limit))
    }

    // -----------------------------------------------------------------
    // Admin operations
    // -----------------------------------------------------------------

    /// Reset all failed units of a task back to `pending`. Returns the
    /// number of units reset.
    pub async fn reset_failed(&self, task_id: Uuid) -> Result<u64, ControlError> {
        self.load_task(task_id).await?;
        runtime_db::reset_runtimes(&self.pool, task_id, &[UnitStatus::Failed])
            .await
            .map_err(ControlError::Storage)
    }

    /// Force a single unit back to `pending`. Rejected while the unit is
    /// owned by a live worker.
    pub async fn reset_unit(&self, unit_id: Uuid) -> Result<(), ControlError> {
        let unit = runtime_db::get_runtime(&self.pool, unit_id)
            .await
            .map_err(ControlError::Storage)?
            .ok_or(ControlError::UnitNotFound(unit_id))?;

        if unit.status == UnitStatus::Running && self.has_execution(unit.task_id) {
            return Err(ControlError::InvalidState(format!(
                "unit {} is owned by a live worker",
                unit.unit_name
            )));
        }

        runtime_db::reset_unit(&self.pool, unit_id)
            .await
            .map_err(ControlError::Storage)?;
        Ok(())
    }

    /// Delete history rows matching a search pattern. Returns the number
    /// of rows deleted.
    pub async fn clear_by_pattern(
        &self,
        task_id: Uuid,
        pattern: &str,
    ) -> Result<u64, ControlError> {
        self.load_task(task_id).await?;
        unit_histories::clear_by_pattern(&self.pool, task_id, pattern)
            .await
            .map_err(ControlError::Storage)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn load_task(&self, task_id: Uuid) -> Result<SyncTask, ControlError> {
        task_db::get_task(&self.pool, task_id)
            .await
            .map_err(ControlError::Storage)?
            .ok_or(ControlError::TaskNotFound(task_id))
    }

    async fn load_endpoints(
        &self,
        task: &SyncTask,
    ) -> Result<(Arc<DataSource>, Arc<DataSource>), ControlError> {
        if task.source_id == task.target_id {
            return Err(ControlError::Validation(
                "source and target data source must differ".into(),
            ));
        }

        let source = source_db::get_data_source(&self.pool, task.source_id)
            .await
            .map_err(ControlError::Storage)?
            .ok_or_else(|| {
                ControlError::Validation(format!("source data source {} missing", task.source_id))
            })?;
        let target = source_db::get_data_source(&self.pool, task.target_id)
            .await
            .map_err(ControlError::Storage)?
            .ok_or_else(|| {
                ControlError::Validation(format!("target data source {} missing", task.target_id))
            })?;

        if source.kind != task.source_kind {
            return Err(ControlError::Validation(format!(
                "task expects {} source but {} is {}",
                task.source_kind, source.name, source.kind
            )));
        }
        if target.kind != task.target_kind {
            return Err(ControlError::Validation(format!(
                "task expects {} target but {} is {}",
                task.target_kind, target.name, target.kind
            )));
        }

        Ok((Arc::new(source), Arc::new(target)))
    }

    fn log(&self, task_id: Uuid, level: LogLevel, category: LogCategory, message: &str) {
        let entry = LogEntry::new(level, category, message);
        self.logs.append(task_id, entry.clone());
        self.bus.publish(task_id, &SyncEvent::Log(vec![entry]));
    }

    /// Build the queue, spawn the workers, the progress pusher, and the
    /// monitor that tears everything down.
    fn spawn_execution(
        &self,
        task: Arc<SyncTask>,
        config: Arc<TaskConfig>,
        source: Arc<DataSource>,
        target: Arc<DataSource>,
        pending: Vec<TaskUnitRuntime>,
    ) {
        let task_id = task.id;
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        // Pre-load the queue and close it: workers drain until empty.
        let (queue_tx, queue_rx) = mpsc::channel(pending.len());
        let worker_count = (config.thread_count as usize).min(pending.len()).max(1);
        for unit in pending {
            // Capacity equals the unit count, so this never blocks.
            let _ = queue_tx.try_send(unit);
        }
        drop(queue_tx);
        let queue: worker::UnitQueue = Arc::new(Mutex::new(queue_rx));

        let ctx = PipelineCtx {
            pool: self.pool.clone(),
            bus: Arc::clone(&self.bus),
            logs: Arc::clone(&self.logs),
            factory: Arc::clone(&self.factory),
            task: Arc::clone(&task),
            config: Arc::clone(&config),
            source,
            target,
            cancel: cancel.clone(),
        };

        if task.mode == SyncMode::Incremental {
            ctx.log(
                LogLevel::Warn,
                LogCategory::All,
                "incremental mode: change capture is not wired, running bulk phase only",
            );
        }
        ctx.log(
            LogLevel::Info,
            LogCategory::All,
            format!("task started with {worker_count} worker(s)"),
        );

        {
            let mut executions = self.executions.lock().expect("execution map lock poisoned");
            executions.insert(
                task_id,
                ExecutionHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            workers.spawn(worker::worker_loop(ctx.clone(), Arc::clone(&queue)));
        }

        // Periodic progress pusher; stopped by the monitor after the final
        // snapshot. Consults is_running before every push.
        let pusher_cancel = CancellationToken::new();
        {
            let pusher_token = pusher_cancel.clone();
            let pool = self.pool.clone();
            let bus = Arc::clone(&self.bus);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(PROGRESS_PUSH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = pusher_token.cancelled() => return,
                        _ = ticker.tick() => {
                            if !task_db::is_running(&pool, task_id).await.unwrap_or(false) {
                                continue;
                            }
                            if let Ok(snapshot) = progress::snapshot(&pool, task_id).await {
                                bus.publish(task_id, &SyncEvent::Progress(snapshot));
                            }
                        }
                    }
                }
            });
        }

        // Monitor: waits on the worker barrier, decides the task's next
        // status, clears is_running, and signals completion.
        let executions = Arc::clone(&self.executions);
        let monitor_ctx = ctx;
        tokio::spawn(async move {
            while workers.join_next().await.is_some() {}

            let status = terminal_status(&monitor_ctx).await;

            {
                let mut executions = executions.lock().expect("execution map lock poisoned");
                executions.remove(&task_id);
            }

            if let Err(e) = task_db::release_running(&monitor_ctx.pool, task_id, status).await {
                tracing::error!(task_id = %task_id, error = %e, "failed to release is_running");
            }

            match status {
                TaskStatus::Completed => monitor_ctx.log(
                    LogLevel::Success,
                    LogCategory::Complete,
                    "task completed",
                ),
                TaskStatus::Failed => monitor_ctx.log(
                    LogLevel::Error,
                    LogCategory::All,
                    "task failed",
                ),
                _ => monitor_ctx.log(LogLevel::Info, LogCategory::All, "task paused"),
            }

            monitor_ctx.push_progress().await;
            pusher_cancel.cancel();
            let _ = done_tx.send(true);
        });
    }
}

/// Decide where the task lands when its workers have all returned.
async fn terminal_status(ctx: &PipelineCtx) -> TaskStatus {
    let progress = match runtime_db::get_unit_progress(&ctx.pool, ctx.task.id).await {
        Ok(progress) => progress,
        Err(e) => {
            tracing::error!(task_id = %ctx.task.id, error = %e, "failed to read unit progress");
            return TaskStatus::Failed;
        }
    };

    if progress.failed > 0 && ctx.config.error_policy == ErrorPolicy::Pause {
        TaskStatus::Failed
    } else if progress.pending == 0 && progress.running == 0 && progress.paused == 0 {
        // Every unit is terminal; under `skip` failed units do not stop the
        // task from completing.
        TaskStatus::Completed
    } else {
        TaskStatus::Paused
    }
}

/// Wait until the monitor reports the execution finished.
async fn wait_done(mut done: watch::Receiver<bool>) {
    // An error means the monitor dropped the sender, which only happens
    // after completion.
    let _ = done.wait_for(|finished| *finished).await;
}
