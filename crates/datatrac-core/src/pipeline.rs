//! Per-unit streaming pipeline: reader to writer with batch commit,
//! progress accounting, and cooperative cancellation.
//!
//! The unit state machine lives here. A unit enters `running` on entry and
//! leaves through exactly one of `completed`, `failed`, or `paused`.
//! Cancellation is observed between batches only; an in-flight batch write
//! always finishes (or fails) first so the stored counter matches what was
//! actually written.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, anyhow, bail};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use datatrac_db::models::{DataSource, EngineKind, SyncTask, TaskUnitRuntime, UnitKind};
use datatrac_db::queries::unit_histories::{self, NewUnitHistory};
use datatrac_db::queries::unit_runtimes as runtime_db;

use crate::adapter::{AdapterFactory, Cursor, EngineAdapter, EntityRef};
use crate::events::{ErrorRecord, EventBus, SyncEvent};
use crate::logbuf::{LogCategory, LogEntry, LogHub, LogLevel};
use crate::progress;
use crate::taskconfig::{ErrorPolicy, TargetExistsPolicy, TaskConfig, UnitPlan};

/// Everything a worker needs to run units of one task. Cloned per worker.
#[derive(Clone)]
pub struct PipelineCtx {
    pub pool: PgPool,
    pub bus: Arc<EventBus>,
    pub logs: Arc<LogHub>,
    pub factory: Arc<dyn AdapterFactory>,
    pub task: Arc<SyncTask>,
    pub config: Arc<TaskConfig>,
    pub source: Arc<DataSource>,
    pub target: Arc<DataSource>,
    pub cancel: CancellationToken,
}

impl PipelineCtx {
    /// Append a log entry and push it to subscribers.
    pub fn log(&self, level: LogLevel, category: LogCategory, message: impl Into<String>) {
        let entry = LogEntry::new(level, category, message);
        tracing::debug!(task_id = %self.task.id, message = %entry.message, "task log");
        self.logs.append(self.task.id, entry.clone());
        self.bus.publish(self.task.id, &SyncEvent::Log(vec![entry]));
    }

    fn error_event(&self, unit_name: &str, message: &str) {
        self.bus.publish(
            self.task.id,
            &SyncEvent::Error(ErrorRecord {
                unit_name: Some(unit_name.to_owned()),
                message: message.to_owned(),
                at: chrono::Utc::now(),
            }),
        );
    }

    /// Re-read the store and push a progress event, best-effort.
    pub async fn push_progress(&self) {
        match progress::snapshot(&self.pool, self.task.id).await {
            Ok(snapshot) => self
                .bus
                .publish(self.task.id, &SyncEvent::Progress(snapshot)),
            Err(e) => {
                tracing::warn!(task_id = %self.task.id, error = %e, "failed to build progress snapshot");
            }
        }
    }
}

/// Terminal disposition of one unit run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed,
    Paused,
    Failed,
}

/// Run one unit to a terminal status. Never panics the worker: every error
/// is converted into a `failed` runtime row with the message recorded.
pub async fn run_unit(ctx: &PipelineCtx, unit: &TaskUnitRuntime) -> UnitOutcome {
    let started = Instant::now();

    match drive_unit(ctx, unit, started).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = format!("{e:#}");
            tracing::warn!(
                task_id = %ctx.task.id,
                unit = %unit.unit_name,
                error = %message,
                "unit failed"
            );
            // Best effort: the row may be beyond saving when the store
            // itself is the problem.
            let _ = runtime_db::fail_unit(&ctx.pool, unit.id, &message).await;
            ctx.log(
                LogLevel::Error,
                LogCategory::Sync,
                format!("{}: {message}", unit.unit_name),
            );
            ctx.error_event(&unit.unit_name, &message);
            ctx.push_progress().await;
            UnitOutcome::Failed
        }
    }
}

async fn drive_unit(
    ctx: &PipelineCtx,
    unit: &TaskUnitRuntime,
    started: Instant,
) -> Result<UnitOutcome> {
    // 1. Resolve the unit against the current config.
    let plan = ctx
        .config
        .resolve_unit(&unit.unit_name)
        .ok_or_else(|| anyhow!("no mapping for unit {} in task config", unit.unit_name))?;

    // pending -> running, recording started_at.
    let rows = runtime_db::begin_unit(&ctx.pool, unit.id)
        .await
        .context("failed to mark unit running")?;
    if rows == 0 {
        bail!("unit {} is no longer pending", unit.unit_name);
    }
    ctx.log(
        LogLevel::Info,
        LogCategory::Sync,
        format!("{}: started", unit.unit_name),
    );
    ctx.push_progress().await;

    // 2. Open reader and writer; both are closed on every exit below.
    let mut source = ctx
        .factory
        .open(&ctx.source)
        .await
        .with_context(|| format!("failed to open source {}", ctx.source.name))?;
    let mut target = match ctx.factory.open(&ctx.target).await {
        Ok(adapter) => adapter,
        Err(e) => {
            source.close().await;
            return Err(anyhow!(e).context(format!("failed to open target {}", ctx.target.name)));
        }
    };

    let outcome = stream_unit(ctx, unit, &plan, source.as_mut(), target.as_mut(), started).await;

    source.close().await;
    target.close().await;
    outcome
}

async fn stream_unit(
    ctx: &PipelineCtx,
    unit: &TaskUnitRuntime,
    plan: &UnitPlan,
    source: &mut dyn EngineAdapter,
    target: &mut dyn EngineAdapter,
    started: Instant,
) -> Result<UnitOutcome> {
    let source_entity = EntityRef {
        schema: plan.source_schema.clone(),
        name: plan.source_name.clone(),
    };
    let target_entity = EntityRef {
        schema: plan.target_schema.clone(),
        name: plan.target_name.clone(),
    };

    // 3. Charset from the source schema; safe defaults if the lookup fails.
    let charset = match &plan.source_schema {
        Some(schema) => source.schema_charset(schema).await.unwrap_or_else(|e| {
            tracing::warn!(schema = %schema, error = %e, "charset lookup failed, using defaults");
            None
        }),
        None => None,
    };

    // 4. Ensure the target schema exists.
    if let Some(schema) = &plan.target_schema {
        let created = target
            .ensure_schema(schema, charset.as_ref())
            .await
            .with_context(|| format!("failed to ensure schema {schema}"))?;
        if created {
            ctx.log(
                LogLevel::Info,
                LogCategory::Create,
                format!("created schema {schema}"),
            );
        }
    }

    // 5. Apply the target-exists policy.
    match ctx.config.target_exists {
        TargetExistsPolicy::Drop => {
            let shape = source
                .describe(&source_entity)
                .await
                .with_context(|| format!("failed to describe {source_entity}"))?;
            target
                .drop_entity(&target_entity)
                .await
                .with_context(|| format!("failed to drop {target_entity}"))?;
            target
                .create_entity(&target_entity, &shape)
                .await
                .with_context(|| format!("failed to create {target_entity}"))?;
            let noun = match plan.kind {
                UnitKind::Table => "table",
                UnitKind::Index => "index",
            };
            ctx.log(
                LogLevel::Info,
                LogCategory::Create,
                format!("created {noun} {target_entity}"),
            );
        }
        TargetExistsPolicy::Truncate => {
            target
                .truncate(&target_entity)
                .await
                .with_context(|| format!("failed to truncate {target_entity}"))?;
        }
        TargetExistsPolicy::Append => {}
    }

    // 6. Capture the total and persist it.
    let total = source
        .count_records(&source_entity)
        .await
        .with_context(|| format!("failed to count {source_entity}"))? as i64;
    runtime_db::set_total_records(&ctx.pool, unit.id, total)
        .await
        .context("failed to persist total records")?;

    if total == 0 {
        runtime_db::complete_unit(&ctx.pool, unit.id, true)
            .await
            .context("failed to complete unit")?;
        finish_unit(ctx, unit, plan, total, started).await;
        return Ok(UnitOutcome::Completed);
    }

    // Resume position. Offset scans continue from the stored counter; a
    // scroll cannot be replayed, so DOC sources restart the scan and rely
    // on id-stable writes.
    let mut processed = unit.processed_records;
    let mut batch_index = unit.last_batch_index;
    let mut cursor: Option<Cursor> = None;
    if processed > 0 {
        match source.kind() {
            EngineKind::Sql => {
                cursor = Some(Cursor::Offset(processed as u64));
            }
            EngineKind::Doc => {
                runtime_db::clear_progress(&ctx.pool, unit.id)
                    .await
                    .context("failed to restart unit counters")?;
                processed = 0;
                batch_index = 0;
            }
        }
    }

    // 7. Streaming loop.
    let batch_size = ctx.config.batch_size;
    let mut scanned = processed;
    let mut skipped_batches: i64 = 0;

    loop {
        // 7a. Cancellation check before the next read.
        if ctx.cancel.is_cancelled() {
            return pause_out(ctx, unit).await;
        }

        // 7b. Read up to batchSize records, never past the captured total.
        let remaining = total - scanned;
        if remaining <= 0 {
            break;
        }
        let limit = (remaining as u64).min(batch_size as u64) as u32;
        let (records, next_cursor) = source
            .read_batch(&source_entity, cursor.take(), limit)
            .await
            .with_context(|| format!("failed to read from {source_entity}"))?;
        if records.is_empty() {
            break;
        }
        cursor = next_cursor;
        scanned += records.len() as i64;
        batch_index += 1;

        // Cancellation between read and write: drop the unwritten page; a
        // resume re-reads it from the stored counter.
        if ctx.cancel.is_cancelled() {
            return pause_out(ctx, unit).await;
        }

        // 7c. Write the batch.
        if let Err(e) = target.write_batch(&target_entity, &records).await {
            let transient = e.is_transient();
            if ctx.config.error_policy == ErrorPolicy::Skip && transient {
                skipped_batches += 1;
                let message = format!(
                    "{}: batch {batch_index} skipped ({} records): {e}",
                    unit.unit_name,
                    records.len()
                );
                ctx.log(LogLevel::Error, LogCategory::Sync, &message);
                ctx.error_event(&unit.unit_name, &message);
                // Counter untouched; the cursor has already moved past the
                // failed page.
                continue;
            }
            return Err(anyhow!(e).context(format!("failed to write to {target_entity}")));
        }

        // 7d. Commit the progress counter.
        processed += records.len() as i64;
        runtime_db::advance_progress(&ctx.pool, unit.id, records.len() as i64, batch_index)
            .await
            .context("failed to advance progress")?;

        // 7e. Emit progress + sync log.
        ctx.log(
            LogLevel::Info,
            LogCategory::Sync,
            format!(
                "{}: batch {batch_index}, {processed}/{total} records",
                unit.unit_name
            ),
        );
        ctx.push_progress().await;
    }

    // 8. Clean exit. Counters are aligned to the total only when nothing
    // was skipped; skipped batches keep the counter truthful.
    runtime_db::complete_unit(&ctx.pool, unit.id, skipped_batches == 0)
        .await
        .context("failed to complete unit")?;
    finish_unit(ctx, unit, plan, total, started).await;
    Ok(UnitOutcome::Completed)
}

async fn pause_out(ctx: &PipelineCtx, unit: &TaskUnitRuntime) -> Result<UnitOutcome> {
    runtime_db::pause_unit(&ctx.pool, unit.id)
        .await
        .context("failed to pause unit")?;
    ctx.log(
        LogLevel::Info,
        LogCategory::Sync,
        format!("{}: paused", unit.unit_name),
    );
    ctx.push_progress().await;
    Ok(UnitOutcome::Paused)
}

async fn finish_unit(
    ctx: &PipelineCtx,
    unit: &TaskUnitRuntime,
    plan: &UnitPlan,
    total: i64,
    started: Instant,
) {
    let duration_ms = started.elapsed().as_millis() as i64;
    let history = NewUnitHistory {
        task_id: ctx.task.id,
        unit_name: &unit.unit_name,
        pattern: &plan.pattern,
        total_records: total,
        duration_ms,
    };
    if let Err(e) = unit_histories::record_history(&ctx.pool, &history).await {
        tracing::warn!(unit = %unit.unit_name, error = %e, "failed to record unit history");
    }

    ctx.log(
        LogLevel::Success,
        LogCategory::Complete,
        format!(
            "{}: completed, {total} records in {duration_ms} ms",
            unit.unit_name
        ),
    );
    ctx.push_progress().await;
}
