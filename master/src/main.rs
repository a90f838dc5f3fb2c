mod config;
mod failure;
mod handlers;
mod invoker;
mod packager;
mod planner;
mod queue;
mod state;
mod store;
mod sweeper;
mod tracker;

use anyhow::{Context, Result};
use clap::Parser;
use common::Storage;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::MasterConfig;
use crate::failure::FailureHandler;
use crate::invoker::{Invoker, SpawnInvoker};
use crate::packager::Packager;
use crate::queue::WorkQueue;
use crate::state::AppState;
use crate::store::{MemoryTaskStore, TaskStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fanout_master=debug,tower_http=info")),
        )
        .init();

    let cfg = MasterConfig::parse();
    let settings = Arc::new(cfg.settings());
    info!("config: {:?}", cfg);

    let storage = Storage::local(&cfg.data_dir)?;
    let store: Arc<dyn TaskStore> = match &cfg.state_file {
        Some(path) => Arc::new(MemoryTaskStore::with_snapshot(path)?),
        None => Arc::new(MemoryTaskStore::new()),
    };

    let (queue, dead_letters) = WorkQueue::new(settings.max_receive_count, settings.visibility_timeout);
    let queue = Arc::new(queue);

    let packager = Arc::new(Packager::new(store.clone(), storage.clone(), settings.clone()));
    let invoker: Arc<dyn Invoker> = Arc::new(SpawnInvoker::new(packager));

    // dead letters -> failure handler
    let failure_handler = Arc::new(FailureHandler::new(store.clone(), invoker.clone()));
    tokio::spawn(failure::run_dead_letter_loop(
        failure_handler,
        queue.clone(),
        dead_letters,
    ));

    // tareas colgadas en PROCESSING
    tokio::spawn(sweeper::run_stuck_sweeper(
        store.clone(),
        invoker.clone(),
        settings.stuck_threshold,
        settings.sweep_interval,
    ));

    // leases vencidos de la cola
    tokio::spawn(sweeper::run_visibility_sweeper(
        queue.clone(),
        sweeper::VISIBILITY_SWEEP_INTERVAL,
    ));

    let state = AppState::new(store, storage, queue, invoker, settings);
    let app = handlers::build_router(state);

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", cfg.listen_addr))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
