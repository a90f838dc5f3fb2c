//! Completion tracker: cuenta chunks terminados y dispara el packager
//! exactamente una vez por tarea.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::invoker::Invoker;
use crate::store::{ChunkAck, TaskStore};

pub struct CompletionTracker {
    store: Arc<dyn TaskStore>,
    invoker: Arc<dyn Invoker>,
}

impl CompletionTracker {
    pub fn new(store: Arc<dyn TaskStore>, invoker: Arc<dyn Invoker>) -> Self {
        Self { store, invoker }
    }

    pub async fn chunk_completed(&self, task_id: &str, chunk_index: u32) -> Result<ChunkAck> {
        let ack = self.store.acknowledge_chunk(task_id, chunk_index).await?;

        match ack {
            ChunkAck::Counted { completed, total } => {
                debug!(
                    "tarea {}: chunk {} listo ({}/{})",
                    task_id, chunk_index, completed, total
                );
            }
            ChunkAck::Duplicate { completed, total } => {
                debug!(
                    "tarea {}: chunk {} repetido, se ignora ({}/{})",
                    task_id, chunk_index, completed, total
                );
            }
            ChunkAck::Finalize { total } => {
                info!(
                    "tarea {}: {} chunks completos, disparando packager",
                    task_id, total
                );
                self.invoker.invoke_packager(task_id);
            }
            ChunkAck::Closed(status) => {
                // la parte que escribió este chunk tardío también hay que borrarla
                info!(
                    "tarea {} ya en {}: chunk {} tardío, sólo limpieza",
                    task_id, status, chunk_index
                );
                if status.is_terminal() {
                    self.invoker.invoke_packager(task_id);
                }
            }
        }
        Ok(ack)
    }
}
