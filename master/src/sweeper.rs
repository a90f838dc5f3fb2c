use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use common::{epoch_secs, TaskId, TaskStatus};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::invoker::Invoker;
use crate::queue::WorkQueue;
use crate::store::{Condition, StoreError, TaskStore, TaskUpdate};

pub const SWEEPER_TIMEOUT_REASON: &str = "Task timed out and was cleaned by sweeper.";

/// Cada cuánto se revisan los leases vencidos de la cola.
pub const VISIBILITY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Loop de tareas colgadas:
/// - busca tareas PROCESSING más viejas que `threshold`
/// - las marca FAILED y dispara la limpieza
pub async fn run_stuck_sweeper(
    store: Arc<dyn TaskStore>,
    invoker: Arc<dyn Invoker>,
    threshold: Duration,
    interval: Duration,
) {
    loop {
        sleep(interval).await;

        if let Err(e) = sweep_stuck_once(store.as_ref(), invoker.as_ref(), threshold, epoch_secs()).await {
            warn!("error en sweep de tareas colgadas: {:#}", e);
        }
    }
}

/// Una pasada. Devuelve las tareas que esta pasada marcó FAILED.
pub async fn sweep_stuck_once(
    store: &dyn TaskStore,
    invoker: &dyn Invoker,
    threshold: Duration,
    now: i64,
) -> Result<Vec<TaskId>> {
    let cutoff = now - threshold.as_secs() as i64;
    let processing = store.query_by_status(TaskStatus::Processing).await?;

    let mut swept = Vec::new();
    for task in processing {
        if task.creation_time >= cutoff {
            continue;
        }

        match store
            .update(
                &task.task_id,
                TaskUpdate::failed(SWEEPER_TIMEOUT_REASON),
                Condition::StatusIs(TaskStatus::Processing),
            )
            .await
        {
            Ok(_) => {
                warn!(
                    "tarea {} colgada en PROCESSING desde {} ({}/{:?} chunks), marcando FAILED",
                    task.task_id, task.creation_time, task.completed_chunks, task.total_chunks
                );
                invoker.invoke_packager(&task.task_id);
                swept.push(task.task_id);
            }
            Err(StoreError::ConditionFailed { actual, .. }) => {
                // terminó mientras tanto
                info!("tarea {} pasó a {} durante el sweep", task.task_id, actual);
            }
            Err(e) => warn!("no se pudo barrer la tarea {}: {}", task.task_id, e),
        }
    }

    if !swept.is_empty() {
        info!("sweep: {} tareas colgadas marcadas FAILED", swept.len());
    }
    Ok(swept)
}

/// Devuelve a la cola los chunks cuyo lease venció sin reporte.
pub async fn run_visibility_sweeper(queue: Arc<WorkQueue>, interval: Duration) {
    loop {
        sleep(interval).await;

        match queue.requeue_expired(Instant::now()) {
            Ok(0) => {}
            Ok(n) => {
                let stats = queue.stats().unwrap_or_default();
                info!(
                    "{} chunks con lease vencido devueltos a la cola ({} listos, {} en vuelo)",
                    n, stats.ready, stats.in_flight
                );
            }
            Err(e) => warn!("error revisando leases: {:#}", e),
        }
    }
}
