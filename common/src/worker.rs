use serde::{Deserialize, Serialize};

use crate::chunk::ChunkWorkItem;
use crate::task::TaskId;

pub type WorkerId = String;
pub type Receipt = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveRequest {
    pub worker_id: WorkerId,
    pub max_messages: u32,
}

/// Un work item entregado a un worker. El `receipt` identifica esta
/// entrega concreta (no el mensaje): sirve para confirmarla o rechazarla.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub receipt: Receipt,
    pub receive_count: u32,
    pub item: ChunkWorkItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveResponse {
    pub deliveries: Vec<Delivery>,
}

/// Resultado de un item del batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    pub receipt: Receipt,
    pub task_id: TaskId,
    pub chunk_index: u32,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub worker_id: WorkerId,
    pub results: Vec<ChunkReport>,
}

/// Receipts que el master no pudo dar por completados (se reintentan).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub batch_item_failures: Vec<Receipt>,
}
