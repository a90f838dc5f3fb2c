use anyhow::{Context, Result};
use async_trait::async_trait;
use common::processing::{process_chunk, ChunkOutcome};
use common::{
    ChunkReport, Delivery, LineTransform, ReceiveRequest, ReceiveResponse, ReportRequest,
    ReportResponse, Storage,
};
use futures::{stream, StreamExt};
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Máxima espera entre reintentos cuando el master no responde.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Del lado del worker, el master es sólo una cola con receive/report.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn receive(&self, worker_id: &str, max_messages: u32) -> Result<Vec<Delivery>>;
    async fn report(&self, worker_id: &str, results: Vec<ChunkReport>) -> Result<ReportResponse>;
}

/// Cliente HTTP contra la API de chunks del master.
pub struct MasterClient {
    client: Client,
    base_url: String,
}

impl MasterClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ChunkSource for MasterClient {
    async fn receive(&self, worker_id: &str, max_messages: u32) -> Result<Vec<Delivery>> {
        let url = format!("{}/api/v1/chunks/receive", self.base_url);
        let resp: ReceiveResponse = self
            .client
            .post(&url)
            .json(&ReceiveRequest {
                worker_id: worker_id.to_string(),
                max_messages,
            })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.deliveries)
    }

    async fn report(&self, worker_id: &str, results: Vec<ChunkReport>) -> Result<ReportResponse> {
        let url = format!("{}/api/v1/chunks/report", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&ReportRequest {
                worker_id: worker_id.to_string(),
                results,
            })
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp)
    }
}

/// Lo que necesita el worker para procesar un chunk.
#[derive(Clone)]
pub struct ChunkProcessor {
    pub storage: Storage,
    pub transform: LineTransform,
    pub lookahead: u64,
    pub concurrency: usize,
}

impl ChunkProcessor {
    async fn process_one(&self, delivery: Delivery) -> ChunkReport {
        let item = &delivery.item;
        let result = process_chunk(&self.storage, item, &self.transform, self.lookahead).await;

        let (success, error) = match result {
            Ok(ChunkOutcome::Written { key, lines }) => {
                debug!(
                    "chunk {} de la tarea {}: {} líneas -> {}",
                    item.chunk_index, item.task_id, lines, key
                );
                (true, None)
            }
            Ok(ChunkOutcome::Empty) => (true, None),
            Err(e) => {
                warn!(
                    "error procesando chunk {} de la tarea {} (entrega {}): {:#}",
                    item.chunk_index, item.task_id, delivery.receive_count, e
                );
                (false, Some(format!("{e:#}")))
            }
        };

        ChunkReport {
            receipt: delivery.receipt.clone(),
            task_id: item.task_id.clone(),
            chunk_index: item.chunk_index,
            success,
            error,
        }
    }

    /// Procesa el batch con concurrencia acotada. Un item que falla no frena al resto.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> Vec<ChunkReport> {
        stream::iter(deliveries)
            .map(|d| self.process_one(d))
            .buffer_unordered(self.concurrency.max(1))
            .collect()
            .await
    }
}

/// Un ciclo receive -> procesar -> report. Devuelve cuántos items se recibieron.
pub async fn run_once(
    source: &dyn ChunkSource,
    processor: &ChunkProcessor,
    worker_id: &str,
    batch_size: u32,
) -> Result<usize> {
    let deliveries = source.receive(worker_id, batch_size).await?;
    if deliveries.is_empty() {
        return Ok(0);
    }
    let received = deliveries.len();

    let reports = processor.process_batch(deliveries).await;
    let failed = reports.iter().filter(|r| !r.success).count();

    let resp = source.report(worker_id, reports).await?;
    info!(
        "batch de {} chunks: {} fallidos, {} devueltos a la cola",
        received,
        failed,
        resp.batch_item_failures.len()
    );
    Ok(received)
}

/// Loop principal del worker.
/// - Pide batches mientras haya trabajo.
/// - Cola vacía: duerme `poll_interval`.
/// - Error de transporte: backoff exponencial hasta MAX_BACKOFF.
pub async fn run(
    source: &dyn ChunkSource,
    processor: &ChunkProcessor,
    worker_id: &str,
    batch_size: u32,
    poll_interval: Duration,
) {
    let mut backoff = poll_interval.max(Duration::from_millis(100));

    loop {
        match run_once(source, processor, worker_id, batch_size).await {
            Ok(0) => {
                debug!("worker {}: cola vacía", worker_id);
                backoff = poll_interval.max(Duration::from_millis(100));
                sleep(poll_interval).await;
            }
            Ok(_) => {
                backoff = poll_interval.max(Duration::from_millis(100));
            }
            Err(e) => {
                warn!("worker {}: error hablando con el master: {:#}", worker_id, e);
                sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use common::storage::{put_bytes, read_all};
    use common::{ByteRange, ChunkWorkItem};
    use std::sync::Mutex;

    fn delivery(receipt: &str, bucket: &str, range: ByteRange, idx: u32, size: u64) -> Delivery {
        Delivery {
            receipt: receipt.to_string(),
            receive_count: 1,
            item: ChunkWorkItem {
                task_id: "t1".to_string(),
                bucket: bucket.to_string(),
                key: "t1/in.txt".to_string(),
                byte_range: range,
                chunk_index: idx,
                source_size: size,
            },
        }
    }

    fn processor(storage: Storage) -> ChunkProcessor {
        ChunkProcessor {
            storage,
            transform: LineTransform::default(),
            lookahead: 4,
            concurrency: 2,
        }
    }

    /// Cola fija en memoria que anota los reportes.
    #[derive(Default)]
    struct FakeSource {
        batches: Mutex<Vec<Vec<Delivery>>>,
        reports: Mutex<Vec<ChunkReport>>,
        fail_receive: bool,
    }

    #[async_trait]
    impl ChunkSource for FakeSource {
        async fn receive(&self, _worker_id: &str, _max: u32) -> Result<Vec<Delivery>> {
            if self.fail_receive {
                return Err(anyhow!("master caído"));
            }
            Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
        }

        async fn report(&self, _worker_id: &str, results: Vec<ChunkReport>) -> Result<ReportResponse> {
            let failures = results
                .iter()
                .filter(|r| !r.success)
                .map(|r| r.receipt.clone())
                .collect();
            self.reports.lock().unwrap().extend(results);
            Ok(ReportResponse {
                batch_item_failures: failures,
            })
        }
    }

    #[tokio::test]
    async fn one_bad_item_does_not_block_the_batch() {
        let storage = Storage::in_memory();
        put_bytes(storage.uploads(), "t1/in.txt", "a\nb\nc").await.unwrap();

        let batch = vec![
            delivery("r0", "uploads", ByteRange::new(0, 2), 0, 5),
            delivery("r1", "nope", ByteRange::new(2, 4), 1, 5),
            delivery("r2", "uploads", ByteRange::new(4, 5), 2, 5),
        ];
        let mut reports = processor(storage.clone()).process_batch(batch).await;
        reports.sort_by_key(|r| r.chunk_index);

        assert!(reports[0].success);
        assert!(!reports[1].success);
        assert!(reports[1].error.is_some());
        assert!(reports[2].success);

        let part = read_all(storage.parts(), "t1/part-000002.txt").await.unwrap();
        assert_eq!(&part[..], b"Hello! c");
    }

    #[tokio::test]
    async fn run_once_reports_every_item() {
        let storage = Storage::in_memory();
        put_bytes(storage.uploads(), "t1/in.txt", "a\nb\n").await.unwrap();

        let source = FakeSource::default();
        source.batches.lock().unwrap().push(vec![
            delivery("r0", "uploads", ByteRange::new(0, 2), 0, 4),
            delivery("r1", "uploads", ByteRange::new(2, 4), 1, 4),
        ]);

        let n = run_once(&source, &processor(storage.clone()), "w1", 10)
            .await
            .unwrap();
        assert_eq!(n, 2);

        let reports = source.reports.lock().unwrap().clone();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.success && r.task_id == "t1"));

        // cola vacía: no hay report
        let n = run_once(&source, &processor(storage), "w1", 10).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(source.reports.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn receive_errors_propagate() {
        let source = FakeSource {
            fail_receive: true,
            ..Default::default()
        };
        let result = run_once(&source, &processor(Storage::in_memory()), "w1", 10).await;
        assert!(result.is_err());
    }
}
