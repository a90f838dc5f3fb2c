use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use common::chunk::upload_key;
use common::storage::{put_bytes, read_all, UPLOADS_BUCKET};
use common::{
    epoch_secs, ChunkReport, ReceiveRequest, ReceiveResponse, ReportRequest, ReportResponse,
    TaskRecord, TaskRegisterRequest, TaskRegisterResponse, UploadEvent,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::planner::PlanSummary;
use crate::state::AppState;
use crate::store::StoreError;

/// Tope de mensajes por receive, como una cola SQS.
pub const MAX_RECEIVE_BATCH: u32 = 10;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(register_task))
        .route("/api/v1/tasks/:task_id", get(get_task))
        .route(
            "/api/v1/uploads/:task_id/:filename",
            put(upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/v1/events/upload", post(upload_event))
        .route("/api/v1/chunks/receive", post(receive_chunks))
        .route("/api/v1/chunks/report", post(report_chunks))
        .route("/api/v1/files/:task_id/:name", get(download_file))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn store_status(e: &StoreError) -> StatusCode {
    match e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::AlreadyExists(_) | StoreError::ConditionFailed { .. } => StatusCode::CONFLICT,
        StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
        StoreError::ChunkOutOfRange { .. } => StatusCode::BAD_REQUEST,
        StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn valid_filename(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && name != "." && name != ".."
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Registra una tarea PENDING y devuelve dónde subir el archivo
async fn register_task(
    State(state): State<AppState>,
    Json(req): Json<TaskRegisterRequest>,
) -> Result<Json<TaskRegisterResponse>, StatusCode> {
    if !valid_filename(&req.filename) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let task_id = req
        .task_id
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut record = TaskRecord::new_pending(task_id.clone(), req.filename.clone());
    record.content_type = req.content_type;

    state.store.insert(record).await.map_err(|e| {
        warn!("no se pudo registrar la tarea {}: {}", task_id, e);
        store_status(&e)
    })?;

    info!("tarea {} registrada ({})", task_id, req.filename);
    Ok(Json(TaskRegisterResponse {
        upload_url: format!("/api/v1/uploads/{}/{}", task_id, req.filename),
        key: upload_key(&task_id, &req.filename),
        bucket: UPLOADS_BUCKET.to_string(),
        task_id,
    }))
}

// Estado de una tarea
async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, StatusCode> {
    match state.store.get(&task_id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("leyendo la tarea {}: {}", task_id, e);
            Err(store_status(&e))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAccepted {
    pub task_id: String,
    pub bucket: String,
    pub key: String,
}

// Guarda el archivo y dispara el planner sin esperar
async fn upload_file(
    State(state): State<AppState>,
    Path((task_id, filename)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<UploadAccepted>), StatusCode> {
    if !valid_filename(&filename) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let key = upload_key(&task_id, &filename);
    let size = body.len();

    put_bytes(state.storage.uploads(), &key, body)
        .await
        .map_err(|e| {
            error!("no se pudo guardar {}: {:#}", key, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    info!("upload {} ({} bytes)", key, size);

    let event = UploadEvent {
        bucket: UPLOADS_BUCKET.to_string(),
        key: key.clone(),
    };
    let planner = state.planner.clone();
    tokio::spawn(async move {
        if let Err(e) = planner.handle_upload(&event).await {
            error!("planner falló para {}: {:#}", event.key, e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadAccepted {
            task_id,
            bucket: UPLOADS_BUCKET.to_string(),
            key,
        }),
    ))
}

// Notificación cruda de almacenamiento: corre el planner y devuelve el resumen
async fn upload_event(
    State(state): State<AppState>,
    Json(event): Json<UploadEvent>,
) -> Result<Json<PlanSummary>, StatusCode> {
    if event.task_id().is_err() {
        return Err(StatusCode::BAD_REQUEST);
    }
    state.planner.handle_upload(&event).await.map(Json).map_err(|e| {
        error!("planner falló para {}: {:#}", event.key, e);
        match e.downcast_ref::<StoreError>() {
            Some(store_err) => store_status(store_err),
            None => StatusCode::UNPROCESSABLE_ENTITY,
        }
    })
}

// Presta un batch de chunks al worker
async fn receive_chunks(
    State(state): State<AppState>,
    Json(req): Json<ReceiveRequest>,
) -> Result<Json<ReceiveResponse>, StatusCode> {
    let max = req.max_messages.clamp(1, MAX_RECEIVE_BATCH) as usize;
    let deliveries = state.queue.receive(&req.worker_id, max).map_err(|e| {
        error!("receive del worker {}: {:#}", req.worker_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(ReceiveResponse { deliveries }))
}

// Resultado por item: los éxitos cuentan y se confirman, los fallos vuelven a la cola
async fn report_chunks(
    State(state): State<AppState>,
    Json(req): Json<ReportRequest>,
) -> Json<ReportResponse> {
    let mut failures = Vec::new();

    for report in &req.results {
        if !handle_report(&state, &req.worker_id, report).await {
            failures.push(report.receipt.clone());
        }
    }

    Json(ReportResponse {
        batch_item_failures: failures,
    })
}

/// `true` si el item quedó confirmado.
async fn handle_report(state: &AppState, worker_id: &str, report: &ChunkReport) -> bool {
    if report.success {
        match state
            .tracker
            .chunk_completed(&report.task_id, report.chunk_index)
            .await
        {
            Ok(_) => {
                match state.queue.ack(&report.receipt) {
                    Ok(true) => {}
                    Ok(false) => info!(
                        "receipt vencido del worker {} (chunk {} de {}), ya contado",
                        worker_id, report.chunk_index, report.task_id
                    ),
                    Err(e) => warn!("ack falló: {:#}", e),
                }
                return true;
            }
            Err(e) => {
                warn!(
                    "reporte de chunk {} de {} rechazado: {:#}",
                    report.chunk_index, report.task_id, e
                );
                release(state, worker_id, &report.receipt, Some(e.to_string()));
                return false;
            }
        }
    }

    warn!(
        "worker {} falló el chunk {} de {}: {}",
        worker_id,
        report.chunk_index,
        report.task_id,
        report.error.as_deref().unwrap_or("sin detalle")
    );
    release(state, worker_id, &report.receipt, report.error.clone());
    false
}

// Devuelve el item a la cola; un receipt ya vencido volvió solo
fn release(state: &AppState, worker_id: &str, receipt: &str, error: Option<String>) {
    match state.queue.nack(receipt, error) {
        Ok(true) => {}
        Ok(false) => info!("receipt vencido del worker {}, el item ya volvió a la cola", worker_id),
        Err(e) => warn!("nack falló: {:#}", e),
    }
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    expires: i64,
}

// Sirve el artefacto final mientras el link no venza
async fn download_file(
    State(state): State<AppState>,
    Path((task_id, name)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    if query.expires < epoch_secs() {
        return Err(StatusCode::GONE);
    }
    if !valid_filename(&name) {
        return Err(StatusCode::BAD_REQUEST);
    }

    let key = format!("{}/{}", task_id, name);
    let body = read_all(state.storage.processed(), &key)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    ))
}
