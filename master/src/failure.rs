//! Failure handler: consume la dead-letter de la cola de chunks.

use anyhow::Result;
use common::TaskStatus;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::invoker::Invoker;
use crate::queue::{DeadLetter, WorkQueue};
use crate::store::{Condition, StoreError, TaskStore, TaskUpdate};

pub const CHUNK_FAILED_REASON: &str = "A chunk failed processing after multiple retries.";

/// Espera antes de reintentar un dead letter que no se pudo procesar.
pub const REDRIVE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    MarkedFailed,
    /// Ya estaba terminal: se conserva el estado (y la primera razón)
    AlreadyTerminal(TaskStatus),
    UnknownTask,
}

pub struct FailureHandler {
    store: Arc<dyn TaskStore>,
    invoker: Arc<dyn Invoker>,
}

impl FailureHandler {
    pub fn new(store: Arc<dyn TaskStore>, invoker: Arc<dyn Invoker>) -> Self {
        Self { store, invoker }
    }

    pub async fn handle_dead_letter(&self, letter: &DeadLetter) -> Result<FailureOutcome> {
        let task_id = letter.item.task_id.as_str();
        warn!(
            "dead letter: chunk {} de la tarea {} tras {} entregas (último error: {})",
            letter.item.chunk_index,
            task_id,
            letter.receive_count,
            letter.last_error.as_deref().unwrap_or("-")
        );

        let condition = Condition::StatusIn(vec![TaskStatus::Pending, TaskStatus::Processing]);
        let outcome = match self
            .store
            .update(task_id, TaskUpdate::failed(CHUNK_FAILED_REASON), condition)
            .await
        {
            Ok(_) => {
                info!("tarea {} marcada FAILED", task_id);
                FailureOutcome::MarkedFailed
            }
            Err(StoreError::ConditionFailed { actual, .. }) => {
                info!("tarea {} ya estaba en {}, no se modifica", task_id, actual);
                FailureOutcome::AlreadyTerminal(actual)
            }
            Err(StoreError::NotFound(_)) => {
                warn!("dead letter de una tarea inexistente: {}", task_id);
                return Ok(FailureOutcome::UnknownTask);
            }
            Err(e) => return Err(e.into()),
        };

        // cleanup en todos los casos: un COMPLETED sólo borra lo que sobre
        self.invoker.invoke_packager(task_id);
        Ok(outcome)
    }
}

/// Consume dead letters hasta que se cierre el canal. Los que fallan se
/// vuelven a encolar después de `REDRIVE_DELAY`.
pub async fn run_dead_letter_loop(
    handler: Arc<FailureHandler>,
    queue: Arc<WorkQueue>,
    mut dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
) {
    while let Some(letter) = dead_letters.recv().await {
        if let Err(e) = handler.handle_dead_letter(&letter).await {
            error!(
                "no se pudo procesar el dead letter de la tarea {} (chunk {}): {:#}",
                letter.item.task_id, letter.item.chunk_index, e
            );
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(REDRIVE_DELAY).await;
                if let Err(e) = queue.redrive(letter) {
                    error!("redrive perdido: {:#}", e);
                }
            });
        }
    }
    info!("canal de dead letters cerrado, termina el failure handler");
}
