use anyhow::{Context, Result};
use clap::Parser;
use common::chunking::DEFAULT_LOOKAHEAD_BYTES;
use common::LineTransform;
use std::{path::PathBuf, time::Duration};

pub const DEFAULT_WORKER_CONCURRENCY: usize = 2;
pub const DEFAULT_BATCH_SIZE: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "fanout-worker")]
#[command(about = "Worker de chunks: pide batches al master, transforma líneas y escribe partes")]
pub struct WorkerConfig {
    /// En Docker: MASTER_URL=http://master:8080
    #[arg(long, env = "MASTER_URL", default_value = "http://localhost:8080")]
    pub master_url: String,

    /// Mismo volumen que el master
    #[arg(long, env = "DATA_DIR", default_value = "/data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = DEFAULT_WORKER_CONCURRENCY)]
    pub concurrency: usize,

    #[arg(long, env = "BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: u32,

    #[arg(long, env = "LOOKAHEAD_BYTES", default_value_t = DEFAULT_LOOKAHEAD_BYTES)]
    pub lookahead_bytes: u64,

    /// Operaciones separadas por '|': prefix=, suffix=, upper, lower, trim
    #[arg(long, env = "LINE_TRANSFORM", default_value = "prefix=Hello! ")]
    pub line_transform: String,

    /// Espera cuando la cola está vacía
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,

    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,
}

impl WorkerConfig {
    pub fn transform(&self) -> Result<LineTransform> {
        self.line_transform
            .parse()
            .with_context(|| format!("LINE_TRANSFORM inválido: {:?}", self.line_transform))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `<hostname>-<uuid corto>` si no vino uno explícito.
    pub fn resolve_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}
