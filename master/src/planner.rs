//! Chunk planner: recibe el evento de "archivo subido", calcula los límites
//! de los chunks y publica un work item por chunk.

use anyhow::{Context, Result};
use common::chunk::processed_key;
use common::chunking::plan_chunks;
use common::storage::{delete_if_exists, object_size, put_bytes};
use common::{ChunkWorkItem, Storage, TaskRecord, TaskStatus, UploadEvent};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::PipelineSettings;
use crate::packager::download_url;
use crate::queue::WorkQueue;
use crate::store::{Condition, StoreError, TaskStore, TaskUpdate};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub total_chunks: u32,
    /// El evento ya se había procesado y se ignoró
    pub duplicate: bool,
}

pub struct ChunkPlanner {
    store: Arc<dyn TaskStore>,
    storage: Storage,
    queue: Arc<WorkQueue>,
    settings: Arc<PipelineSettings>,
}

impl ChunkPlanner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        storage: Storage,
        queue: Arc<WorkQueue>,
        settings: Arc<PipelineSettings>,
    ) -> Self {
        Self {
            store,
            storage,
            queue,
            settings,
        }
    }

    pub async fn handle_upload(&self, event: &UploadEvent) -> Result<PlanSummary> {
        let task_id = event.task_id()?.to_string();
        let filename = event.filename()?.to_string();

        let record = self.ensure_registered(&task_id, &filename).await?;
        if record.status != TaskStatus::Pending {
            info!(
                "evento repetido para la tarea {} (ya en {}), se ignora",
                task_id, record.status
            );
            return Ok(duplicate(&record));
        }

        let source = match self.storage.bucket(&event.bucket) {
            Ok(store) => store,
            Err(e) => {
                self.fail(&task_id, format!("Unknown source bucket: {}", event.bucket))
                    .await;
                return Err(e);
            }
        };

        let size = match object_size(source, &event.key).await {
            Ok(size) => size,
            Err(e) => {
                error!("no se pudo leer el tamaño de {}: {:#}", event.key, e);
                self.fail(&task_id, format!("Could not read uploaded file: {e}"))
                    .await;
                return Err(e);
            }
        };

        if size == 0 {
            return self.complete_empty(&record, event, &filename).await;
        }

        let ranges = match plan_chunks(source, &event.key, size, &self.settings.chunking).await {
            Ok(ranges) => ranges,
            Err(e) => {
                error!("planificación de la tarea {} falló: {:#}", task_id, e);
                self.fail(&task_id, format!("Chunk planning failed: {e}")).await;
                return Err(e);
            }
        };
        let total = ranges.len() as u32;

        // contadores antes de publicar: ningún reporte puede llegar antes que el total
        let update = TaskUpdate::status(TaskStatus::Processing)
            .with_total_chunks(total)
            .with_source(&event.bucket, &event.key);
        match self
            .store
            .update(&task_id, update, Condition::StatusIs(TaskStatus::Pending))
            .await
        {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { actual, .. }) => {
                info!("la tarea {} pasó a {} en paralelo, se ignora el evento", task_id, actual);
                let current = self.store.get(&task_id).await?.unwrap_or(record);
                return Ok(duplicate(&current));
            }
            Err(e) => return Err(e.into()),
        }

        for (idx, range) in ranges.into_iter().enumerate() {
            let item = ChunkWorkItem {
                task_id: task_id.clone(),
                bucket: event.bucket.clone(),
                key: event.key.clone(),
                byte_range: range,
                chunk_index: idx as u32,
                source_size: size,
            };
            if let Err(e) = self.queue.send(item) {
                self.fail(&task_id, format!("Could not publish chunk {idx}: {e}"))
                    .await;
                return Err(e);
            }
        }

        info!(
            "tarea {}: {} bytes en {} chunks publicados",
            task_id, size, total
        );
        Ok(PlanSummary {
            task_id,
            status: TaskStatus::Processing,
            total_chunks: total,
            duplicate: false,
        })
    }

    async fn ensure_registered(&self, task_id: &str, filename: &str) -> Result<TaskRecord> {
        if let Some(record) = self.store.get(task_id).await? {
            return Ok(record);
        }

        info!("tarea {} no registrada, se registra desde el evento", task_id);
        match self
            .store
            .insert(TaskRecord::new_pending(task_id, filename))
            .await
        {
            Ok(record) => Ok(record),
            Err(StoreError::AlreadyExists(_)) => self
                .store
                .get(task_id)
                .await?
                .with_context(|| format!("tarea {task_id} desapareció")),
            Err(e) => Err(e.into()),
        }
    }

    /// Archivo vacío: artefacto final vacío y COMPLETED sin pasar por PROCESSING.
    async fn complete_empty(
        &self,
        record: &TaskRecord,
        event: &UploadEvent,
        filename: &str,
    ) -> Result<PlanSummary> {
        let task_id = record.task_id.as_str();
        let original = if record.original_filename.is_empty() {
            filename
        } else {
            record.original_filename.as_str()
        };

        let final_key = processed_key(task_id, original);
        if let Err(e) = put_bytes(self.storage.processed(), &final_key, Vec::<u8>::new()).await {
            self.fail(task_id, format!("Could not write empty output: {e}"))
                .await;
            return Err(e);
        }

        let expires = common::epoch_secs() + self.settings.url_ttl.as_secs() as i64;
        let url = download_url(
            &self.settings.public_url,
            task_id,
            &common::chunk::processed_filename(original),
            expires,
        );
        let update = TaskUpdate::completed(url)
            .with_total_chunks(0)
            .with_source(&event.bucket, &event.key);
        match self
            .store
            .update(task_id, update, Condition::StatusIs(TaskStatus::Pending))
            .await
        {
            Ok(_) => {}
            Err(StoreError::ConditionFailed { .. }) => {
                let current = self.store.get(task_id).await?.unwrap_or_else(|| record.clone());
                return Ok(duplicate(&current));
            }
            Err(e) => return Err(e.into()),
        }

        if let Ok(source) = self.storage.bucket(&event.bucket) {
            if let Err(e) = delete_if_exists(source, &event.key).await {
                warn!("no se pudo borrar el origen vacío {}: {:#}", event.key, e);
            }
        }

        info!("tarea {}: archivo vacío, COMPLETED sin chunks", task_id);
        Ok(PlanSummary {
            task_id: task_id.to_string(),
            status: TaskStatus::Completed,
            total_chunks: 0,
            duplicate: false,
        })
    }

    async fn fail(&self, task_id: &str, reason: String) {
        let condition = Condition::StatusIn(vec![TaskStatus::Pending, TaskStatus::Processing]);
        if let Err(e) = self
            .store
            .update(task_id, TaskUpdate::failed(reason), condition)
            .await
        {
            warn!("no se pudo marcar FAILED la tarea {}: {}", task_id, e);
        }
    }
}

fn duplicate(record: &TaskRecord) -> PlanSummary {
    PlanSummary {
        task_id: record.task_id.clone(),
        status: record.status,
        total_chunks: record.total_chunks.unwrap_or(0),
        duplicate: true,
    }
}
