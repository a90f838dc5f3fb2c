pub mod chunk;
pub mod chunking;
pub mod processing;
pub mod storage;
pub mod task;
pub mod transform;
pub mod worker;

pub use chunk::{ByteRange, ChunkWorkItem, UploadEvent};
pub use chunking::ChunkingConfig;
pub use processing::ChunkOutcome;
pub use storage::Storage;
pub use task::{TaskId, TaskRecord, TaskRegisterRequest, TaskRegisterResponse, TaskStatus};
pub use transform::LineTransform;
pub use worker::{
    ChunkReport, Delivery, Receipt, ReceiveRequest, ReceiveResponse, ReportRequest,
    ReportResponse, WorkerId,
};

/// Segundos desde epoch (así se guardan los tiempos en el Task Store).
pub fn epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
