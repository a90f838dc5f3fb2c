use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Transiciones permitidas: PENDING -> PROCESSING -> {COMPLETED | FAILED}.
    /// PENDING -> COMPLETED sólo ocurre con archivos vacíos.
    /// Los estados terminales no se mueven.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Completed) | (Pending, Failed) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registro de una tarea en el Task Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,

    /// None = todavía no planificada
    pub total_chunks: Option<u32>,
    pub completed_chunks: u32,

    /// Índices ya contados por el tracker (marca de idempotencia por chunk)
    #[serde(default)]
    pub acknowledged_chunks: BTreeSet<u32>,

    pub original_filename: String,
    #[serde(default)]
    pub content_type: Option<String>,

    /// Objeto subido (bucket/key) que hay que borrar al limpiar
    #[serde(default)]
    pub source_bucket: Option<String>,
    #[serde(default)]
    pub source_key: Option<String>,

    #[serde(default)]
    pub processed_file_url: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,

    /// Epoch en segundos
    pub creation_time: i64,
    pub updated_time: i64,
}

impl TaskRecord {
    pub fn new_pending(task_id: impl Into<TaskId>, original_filename: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            total_chunks: None,
            completed_chunks: 0,
            acknowledged_chunks: BTreeSet::new(),
            original_filename: original_filename.into(),
            content_type: None,
            source_bucket: None,
            source_key: None,
            processed_file_url: None,
            failure_reason: None,
            creation_time: now,
            updated_time: now,
        }
    }

    /// true cuando todos los chunks distintos ya reportaron
    pub fn all_chunks_done(&self) -> bool {
        matches!(self.total_chunks, Some(total) if self.completed_chunks >= total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRegisterRequest {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRegisterResponse {
    pub task_id: TaskId,
    pub bucket: String,
    pub key: String,
    /// Ruta relativa del master donde hacer PUT del archivo
    pub upload_url: String,
}
