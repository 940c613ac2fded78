//! The bounded worker pool: cooperative loops draining the unit queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

use datatrac_db::models::TaskUnitRuntime;

use crate::pipeline::{self, PipelineCtx, UnitOutcome};
use crate::taskconfig::ErrorPolicy;

/// Shared handle to the pre-loaded, closed unit queue.
pub(crate) type UnitQueue = Arc<Mutex<mpsc::Receiver<TaskUnitRuntime>>>;

/// One worker: pull a unit, run the pipeline, repeat. Exits on queue
/// drained or cancellation. A single unit failure never aborts the pool
/// unless the task-wide error policy is `pause`, in which case the worker
/// fires the shared cancellation signal after the unit is marked failed.
pub(crate) async fn worker_loop(ctx: PipelineCtx, queue: UnitQueue) {
    loop {
        let unit = {
            let mut rx = queue.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                unit = rx.recv() => match unit {
                    Some(unit) => unit,
                    None => return,
                },
            }
        };

        tracing::debug!(
            task_id = %ctx.task.id,
            unit = %unit.unit_name,
            "worker picked up unit"
        );

        let outcome = pipeline::run_unit(&ctx, &unit).await;

        if outcome == UnitOutcome::Failed && ctx.config.error_policy == ErrorPolicy::Pause {
            tracing::warn!(
                task_id = %ctx.task.id,
                unit = %unit.unit_name,
                "unit failed under pause policy, cancelling task"
            );
            ctx.cancel.cancel();
        }
    }
}
