mod config;
mod worker;

use anyhow::Result;
use clap::Parser;
use common::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::WorkerConfig;
use crate::worker::{ChunkProcessor, MasterClient};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fanout_worker=debug,reqwest=info")),
        )
        .init();

    let cfg = WorkerConfig::parse();
    let transform = cfg.transform()?;
    let worker_id = cfg.resolve_worker_id();

    let processor = ChunkProcessor {
        storage: Storage::local(&cfg.data_dir)?,
        transform,
        lookahead: cfg.lookahead_bytes,
        concurrency: cfg.concurrency.max(1),
    };
    let master = MasterClient::new(&cfg.master_url);

    info!(
        "worker {} contra {} (concurrency={}, batch={})",
        worker_id, cfg.master_url, processor.concurrency, cfg.batch_size
    );

    worker::run(
        &master,
        &processor,
        &worker_id,
        cfg.batch_size.max(1),
        cfg.poll_interval(),
    )
    .await;
    Ok(())
}
