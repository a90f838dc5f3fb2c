//! Packager: une las partes de una tarea en el artefacto final y limpia.
//!
//! Se puede invocar varias veces y en paralelo para la misma tarea: la única
//! escritura de estado es `PROCESSING -> COMPLETED` condicionada, y la
//! limpieza sobre objetos ya borrados es un no-op.

use anyhow::{Context, Result};
use common::chunk::{parts_prefix, processed_filename, processed_key, upload_key};
use common::storage::{
    delete_if_exists, delete_object, list_objects, put_bytes, read_object, UPLOADS_BUCKET,
};
use common::{epoch_secs, Storage, TaskRecord, TaskStatus};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;
use crate::store::{Condition, StoreError, TaskStore, TaskUpdate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageOutcome {
    /// Merge hecho y tarea marcada COMPLETED
    Completed { url: String },
    /// Tarea terminal: sólo limpieza
    CleanedUp(TaskStatus),
    /// Todavía hay chunks en vuelo: no se toca nada
    Incomplete { completed: u32, total: Option<u32> },
    /// Tarea inexistente o PENDING
    Skipped,
}

/// Link de descarga con vencimiento. `task_id` y `name` van como segmentos
/// codificados; el router los decodifica al extraerlos.
pub fn download_url(public_url: &str, task_id: &str, name: &str, expires: i64) -> String {
    format!(
        "{}/api/v1/files/{}/{}?expires={}",
        public_url,
        urlencoding::encode(task_id),
        urlencoding::encode(name),
        expires
    )
}

pub struct Packager {
    store: Arc<dyn TaskStore>,
    storage: Storage,
    settings: Arc<PipelineSettings>,
}

impl Packager {
    pub fn new(store: Arc<dyn TaskStore>, storage: Storage, settings: Arc<PipelineSettings>) -> Self {
        Self {
            store,
            storage,
            settings,
        }
    }

    pub fn reference_for(&self, task_id: &str, original_filename: &str) -> String {
        let expires = epoch_secs() + self.settings.url_ttl.as_secs() as i64;
        download_url(
            &self.settings.public_url,
            task_id,
            &processed_filename(original_filename),
            expires,
        )
    }

    pub async fn run(&self, task_id: &str) -> Result<PackageOutcome> {
        let Some(record) = self.store.get(task_id).await? else {
            warn!("packager: tarea {} no existe", task_id);
            return Ok(PackageOutcome::Skipped);
        };

        match record.status {
            TaskStatus::Pending => {
                warn!("packager: tarea {} sigue PENDING, nada que hacer", task_id);
                Ok(PackageOutcome::Skipped)
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                debug!("packager: tarea {} en {}, sólo limpieza", task_id, record.status);
                self.cleanup(&record).await;
                Ok(PackageOutcome::CleanedUp(record.status))
            }
            TaskStatus::Processing if !record.all_chunks_done() => {
                warn!(
                    "packager: tarea {} incompleta ({}/{:?}), no se empaqueta",
                    task_id, record.completed_chunks, record.total_chunks
                );
                Ok(PackageOutcome::Incomplete {
                    completed: record.completed_chunks,
                    total: record.total_chunks,
                })
            }
            TaskStatus::Processing => self.finalize(&record).await,
        }
    }

    async fn finalize(&self, record: &TaskRecord) -> Result<PackageOutcome> {
        let task_id = record.task_id.as_str();

        let final_key = match self.merge(record).await {
            Ok(key) => key,
            Err(e) => {
                error!("packager: merge de la tarea {} falló: {:#}", task_id, e);
                let reason = format!("Packaging failed: {e}");
                match self
                    .store
                    .update(task_id, TaskUpdate::failed(reason), Condition::StatusIs(TaskStatus::Processing))
                    .await
                {
                    Ok(_) | Err(StoreError::ConditionFailed { .. }) => {}
                    Err(store_err) => warn!(
                        "packager: no se pudo marcar FAILED la tarea {}: {}",
                        task_id, store_err
                    ),
                }
                self.cleanup(record).await;
                return Err(e);
            }
        };

        let url = self.reference_for(task_id, &record.original_filename);
        match self
            .store
            .update(
                task_id,
                TaskUpdate::completed(url.clone()),
                Condition::StatusIs(TaskStatus::Processing),
            )
            .await
        {
            Ok(_) => {
                info!("tarea {} COMPLETED -> {}", task_id, final_key);
                self.cleanup(record).await;
                Ok(PackageOutcome::Completed { url })
            }
            Err(StoreError::ConditionFailed { actual, .. }) => {
                warn!(
                    "packager: la tarea {} pasó a {} durante el merge",
                    task_id, actual
                );
                // si la ganó otro packager el artefacto es el suyo
                if actual == TaskStatus::Failed {
                    if let Err(e) = delete_if_exists(self.storage.processed(), &final_key).await {
                        warn!("packager: no se pudo borrar {}: {:#}", final_key, e);
                    }
                }
                self.cleanup(record).await;
                Ok(PackageOutcome::CleanedUp(actual))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Concatena las partes en orden de key. Devuelve la key del artefacto final.
    async fn merge(&self, record: &TaskRecord) -> Result<String> {
        let task_id = record.task_id.as_str();
        let parts = list_objects(self.storage.parts(), &parts_prefix(task_id)).await?;

        let mut chunks: Vec<String> = Vec::with_capacity(parts.len());
        for part in &parts {
            let body = read_object(self.storage.parts(), part)
                .await
                .with_context(|| format!("leyendo parte {part}"))?;
            let text = String::from_utf8_lossy(&body).into_owned();
            if !text.is_empty() {
                chunks.push(text);
            }
        }

        let final_key = processed_key(task_id, &record.original_filename);
        put_bytes(self.storage.processed(), &final_key, chunks.join("\n"))
            .await
            .with_context(|| format!("escribiendo {final_key}"))?;

        debug!(
            "packager: tarea {} unida desde {} partes",
            task_id,
            parts.len()
        );
        Ok(final_key)
    }

    /// Borra partes y archivo origen. Los errores se loguean y se ignoran.
    pub async fn cleanup(&self, record: &TaskRecord) {
        let task_id = record.task_id.as_str();

        match list_objects(self.storage.parts(), &parts_prefix(task_id)).await {
            Ok(parts) => {
                for part in parts {
                    if let Err(e) = delete_object(self.storage.parts(), &part).await {
                        warn!("cleanup: no se pudo borrar la parte {}: {:#}", part, e);
                    }
                }
            }
            Err(e) => warn!("cleanup: no se pudieron listar partes de {}: {:#}", task_id, e),
        }

        let bucket = record.source_bucket.as_deref().unwrap_or(UPLOADS_BUCKET);
        let key = record
            .source_key
            .clone()
            .unwrap_or_else(|| upload_key(task_id, &record.original_filename));

        match self.storage.bucket(bucket) {
            Ok(store) => {
                if let Err(e) = delete_if_exists(store, &key).await {
                    warn!("cleanup: no se pudo borrar el origen {}/{}: {:#}", bucket, key, e);
                }
            }
            Err(e) => warn!("cleanup: bucket de origen inválido {}: {:#}", bucket, e),
        }
    }
}
