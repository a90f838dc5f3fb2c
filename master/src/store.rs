//! Task Store: tabla taskId -> TaskRecord.
//!
//! Toda mutación pasa por operaciones atómicas con precondición sobre el
//! estado actual (`Condition`), nunca por leer-y-después-escribir desde afuera.

use async_trait::async_trait;
use common::{epoch_secs, TaskId, TaskRecord, TaskStatus};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("condition failed for task {task_id}: status is {actual}")]
    ConditionFailed { task_id: TaskId, actual: TaskStatus },

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("chunk {chunk_index} out of range for task {task_id} (total {total:?})")]
    ChunkOutOfRange {
        task_id: TaskId,
        chunk_index: u32,
        total: Option<u32>,
    },

    #[error("task store internal error: {0}")]
    Internal(String),
}

/// Precondición sobre el estado actual de la tarea.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Always,
    StatusIs(TaskStatus),
    StatusIn(Vec<TaskStatus>),
}

impl Condition {
    pub fn holds(&self, status: TaskStatus) -> bool {
        match self {
            Condition::Always => true,
            Condition::StatusIs(s) => status == *s,
            Condition::StatusIn(set) => set.contains(&status),
        }
    }
}

/// Campos a escribir. `None` = no tocar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    /// Fijar el total reinicia el progreso (completed y marcas de chunk).
    pub total_chunks: Option<u32>,
    pub processed_file_url: Option<String>,
    pub failure_reason: Option<String>,
    pub original_filename: Option<String>,
    pub source: Option<(String, String)>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn completed(url: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            processed_file_url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_total_chunks(mut self, total: u32) -> Self {
        self.total_chunks = Some(total);
        self
    }

    pub fn with_source(mut self, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        self.source = Some((bucket.into(), key.into()));
        self
    }
}

/// Resultado de confirmar un chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAck {
    /// Chunk nuevo contado, todavía faltan otros
    Counted { completed: u32, total: u32 },
    /// Este chunk ya estaba contado: no se incrementa nada
    Duplicate { completed: u32, total: u32 },
    /// Este chunk fue el último distinto: hay que empaquetar
    Finalize { total: u32 },
    /// La tarea no está en PROCESSING
    Closed(TaskStatus),
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Crea la tarea; falla si ya existe.
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, StoreError>;

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Aplica `update` sólo si `condition` se cumple sobre el estado actual.
    /// Devuelve el registro ya actualizado.
    async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
        condition: Condition,
    ) -> Result<TaskRecord, StoreError>;

    /// Marca `chunk_index` como hecho e incrementa el contador en un solo paso,
    /// ignorando confirmaciones repetidas del mismo índice.
    async fn acknowledge_chunk(&self, task_id: &str, chunk_index: u32)
        -> Result<ChunkAck, StoreError>;

    async fn query_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;
}

/// Implementación en memoria con snapshot JSON opcional.
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    snapshot_path: Option<PathBuf>,
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            snapshot_path: None,
        }
    }

    /// Carga el snapshot si existe y lo reescribe entero en cada mutación, con
    /// el lock tomado. Pensado para un solo master y volúmenes chicos: cada ack
    /// de chunk reescribe el archivo.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tasks = if path.exists() {
            let raw = fs::read(&path)
                .map_err(|e| StoreError::Internal(format!("leyendo {}: {e}", path.display())))?;
            let records: Vec<TaskRecord> = serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Internal(format!("parseando {}: {e}", path.display())))?;
            info!("task store: {} tareas cargadas de {}", records.len(), path.display());
            records
                .into_iter()
                .map(|r| (r.task_id.clone(), r))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            tasks: Mutex::new(tasks),
            snapshot_path: Some(path),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TaskId, TaskRecord>>, StoreError> {
        self.tasks
            .lock()
            .map_err(|_| StoreError::Internal("lock tasks".to_string()))
    }

    fn persist(&self, tasks: &HashMap<TaskId, TaskRecord>) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        write_snapshot(path, tasks)
            .map_err(|e| StoreError::Internal(format!("snapshot {}: {e}", path.display())))
    }
}

// .tmp + rename para no dejar un snapshot a medio escribir
fn write_snapshot(path: &Path, tasks: &HashMap<TaskId, TaskRecord>) -> std::io::Result<()> {
    let mut records: Vec<&TaskRecord> = tasks.values().collect();
    records.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    let body = serde_json::to_vec(&records)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)
}

fn apply_update(record: &mut TaskRecord, update: TaskUpdate) -> Result<(), StoreError> {
    if let Some(next) = update.status {
        if next != record.status && !record.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                task_id: record.task_id.clone(),
                from: record.status,
                to: next,
            });
        }
        record.status = next;
    }
    if let Some(total) = update.total_chunks {
        record.total_chunks = Some(total);
        record.completed_chunks = 0;
        record.acknowledged_chunks.clear();
    }
    if let Some(url) = update.processed_file_url {
        record.processed_file_url = Some(url);
    }
    if let Some(reason) = update.failure_reason {
        record.failure_reason = Some(reason);
    }
    if let Some(name) = update.original_filename {
        record.original_filename = name;
    }
    if let Some((bucket, key)) = update.source {
        record.source_bucket = Some(bucket);
        record.source_key = Some(key);
    }
    record.updated_time = epoch_secs();
    Ok(())
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.lock()?;
        if tasks.contains_key(&record.task_id) {
            return Err(StoreError::AlreadyExists(record.task_id));
        }
        tasks.insert(record.task_id.clone(), record.clone());
        self.persist(&tasks)?;
        Ok(record)
    }

    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let tasks = self.lock()?;
        Ok(tasks.get(task_id).cloned())
    }

    async fn update(
        &self,
        task_id: &str,
        update: TaskUpdate,
        condition: Condition,
    ) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.lock()?;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        if !condition.holds(record.status) {
            return Err(StoreError::ConditionFailed {
                task_id: task_id.to_string(),
                actual: record.status,
            });
        }

        // se trabaja sobre una copia: si la transición es inválida no queda nada a medias
        let mut next = record.clone();
        apply_update(&mut next, update)?;
        *record = next.clone();

        debug!("tarea {} actualizada: status={}", task_id, next.status);
        self.persist(&tasks)?;
        Ok(next)
    }

    async fn acknowledge_chunk(
        &self,
        task_id: &str,
        chunk_index: u32,
    ) -> Result<ChunkAck, StoreError> {
        let mut tasks = self.lock()?;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::NotFound(task_id.to_string()))?;

        if record.status != TaskStatus::Processing {
            return Ok(ChunkAck::Closed(record.status));
        }
        let total = match record.total_chunks {
            Some(total) if chunk_index < total => total,
            total => {
                return Err(StoreError::ChunkOutOfRange {
                    task_id: task_id.to_string(),
                    chunk_index,
                    total,
                })
            }
        };

        if !record.acknowledged_chunks.insert(chunk_index) {
            return Ok(ChunkAck::Duplicate {
                completed: record.completed_chunks,
                total,
            });
        }

        record.completed_chunks += 1;
        record.updated_time = epoch_secs();
        let completed = record.completed_chunks;

        self.persist(&tasks)?;
        if completed == total {
            Ok(ChunkAck::Finalize { total })
        } else {
            Ok(ChunkAck::Counted { completed, total })
        }
    }

    async fn query_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let tasks = self.lock()?;
        let mut out: Vec<TaskRecord> = tasks
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.creation_time);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn processing_task(store: &MemoryTaskStore, id: &str, total: u32) {
        store
            .insert(TaskRecord::new_pending(id, "in.txt"))
            .await
            .unwrap();
        store
            .update(
                id,
                TaskUpdate::status(TaskStatus::Processing).with_total_chunks(total),
                Condition::StatusIs(TaskStatus::Pending),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn insert_twice_fails() {
        let store = MemoryTaskStore::new();
        store.insert(TaskRecord::new_pending("t1", "a.txt")).await.unwrap();
        let err = store
            .insert(TaskRecord::new_pending("t1", "b.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn duplicate_acks_do_not_count_twice() {
        let store = MemoryTaskStore::new();
        processing_task(&store, "t1", 3).await;

        assert_eq!(
            store.acknowledge_chunk("t1", 0).await.unwrap(),
            ChunkAck::Counted { completed: 1, total: 3 }
        );
        assert_eq!(
            store.acknowledge_chunk("t1", 0).await.unwrap(),
            ChunkAck::Duplicate { completed: 1, total: 3 }
        );
        assert_eq!(
            store.acknowledge_chunk("t1", 2).await.unwrap(),
            ChunkAck::Counted { completed: 2, total: 3 }
        );
        assert_eq!(
            store.acknowledge_chunk("t1", 1).await.unwrap(),
            ChunkAck::Finalize { total: 3 }
        );
        assert!(matches!(
            store.acknowledge_chunk("t1", 1).await.unwrap(),
            ChunkAck::Duplicate { completed: 3, total: 3 }
        ));

        let rec = store.get("t1").await.unwrap().unwrap();
        assert_eq!(rec.completed_chunks, 3);
        assert!(rec.completed_chunks <= rec.total_chunks.unwrap());
    }

    #[tokio::test]
    async fn out_of_range_chunk_is_rejected() {
        let store = MemoryTaskStore::new();
        processing_task(&store, "t1", 2).await;
        let err = store.acknowledge_chunk("t1", 2).await.unwrap_err();
        assert!(matches!(err, StoreError::ChunkOutOfRange { chunk_index: 2, .. }));
    }

    #[tokio::test]
    async fn acks_on_closed_tasks_are_not_counted() {
        let store = MemoryTaskStore::new();
        processing_task(&store, "t1", 2).await;
        store
            .update("t1", TaskUpdate::failed("boom"), Condition::StatusIs(TaskStatus::Processing))
            .await
            .unwrap();
        assert_eq!(
            store.acknowledge_chunk("t1", 0).await.unwrap(),
            ChunkAck::Closed(TaskStatus::Failed)
        );
        assert_eq!(store.get("t1").await.unwrap().unwrap().completed_chunks, 0);
    }

    #[tokio::test]
    async fn completed_is_never_overwritten_by_failed() {
        let store = MemoryTaskStore::new();
        processing_task(&store, "t1", 1).await;
        store
            .update("t1", TaskUpdate::completed("http://x"), Condition::StatusIs(TaskStatus::Processing))
            .await
            .unwrap();

        let not_done = Condition::StatusIn(vec![TaskStatus::Pending, TaskStatus::Processing]);
        let err = store
            .update("t1", TaskUpdate::failed("tarde"), not_done)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConditionFailed { actual: TaskStatus::Completed, .. }
        ));

        // ni siquiera con Always: la transición es inválida
        let err = store
            .update("t1", TaskUpdate::failed("tarde"), Condition::Always)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let rec = store.get("t1").await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert!(rec.failure_reason.is_none());
    }

    #[tokio::test]
    async fn query_by_status_filters() {
        let store = MemoryTaskStore::new();
        processing_task(&store, "p1", 1).await;
        store.insert(TaskRecord::new_pending("q1", "a.txt")).await.unwrap();

        let processing = store.query_by_status(TaskStatus::Processing).await.unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].task_id, "p1");
    }

    #[tokio::test]
    async fn concurrent_acks_count_each_chunk_once() {
        let store = Arc::new(MemoryTaskStore::new());
        processing_task(&store, "t1", 50).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            for idx in 0..50u32 {
                let store = store.clone();
                handles.push(tokio::spawn(async move {
                    store.acknowledge_chunk("t1", idx).await.unwrap()
                }));
            }
        }

        let mut finalizes = 0;
        for h in handles {
            if matches!(h.await.unwrap(), ChunkAck::Finalize { .. }) {
                finalizes += 1;
            }
        }
        assert_eq!(finalizes, 1);
        assert_eq!(store.get("t1").await.unwrap().unwrap().completed_chunks, 50);
    }

    #[tokio::test]
    async fn snapshot_survives_restart() {
        let dir = std::env::temp_dir()
            .join("fanout_store_tests")
            .join(uuid::Uuid::new_v4().to_string());
        let path = dir.join("tasks.json");

        {
            let store = MemoryTaskStore::with_snapshot(&path).unwrap();
            processing_task(&store, "t1", 2).await;
            store.acknowledge_chunk("t1", 1).await.unwrap();
        }

        // una sola línea compacta, sin indentación
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains('\n'));
        assert!(raw.starts_with("[{\""));
        assert!(!path.with_extension("tmp").exists());

        let store = MemoryTaskStore::with_snapshot(&path).unwrap();
        let rec = store.get("t1").await.unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Processing);
        assert_eq!(rec.completed_chunks, 1);
        assert_eq!(
            store.acknowledge_chunk("t1", 1).await.unwrap(),
            ChunkAck::Duplicate { completed: 1, total: 2 }
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
