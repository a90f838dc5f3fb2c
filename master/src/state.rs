// master/src/state.rs

use common::Storage;
use std::sync::Arc;

use crate::config::PipelineSettings;
use crate::invoker::Invoker;
use crate::planner::ChunkPlanner;
use crate::queue::WorkQueue;
use crate::store::TaskStore;
use crate::tracker::CompletionTracker;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub storage: Storage,
    // chunks pendientes y prestados a workers
    pub queue: Arc<WorkQueue>,
    pub planner: Arc<ChunkPlanner>,
    pub tracker: Arc<CompletionTracker>,
    pub settings: Arc<PipelineSettings>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn TaskStore>,
        storage: Storage,
        queue: Arc<WorkQueue>,
        invoker: Arc<dyn Invoker>,
        settings: Arc<PipelineSettings>,
    ) -> Self {
        let planner = Arc::new(ChunkPlanner::new(
            store.clone(),
            storage.clone(),
            queue.clone(),
            settings.clone(),
        ));
        let tracker = Arc::new(CompletionTracker::new(store.clone(), invoker));

        Self {
            store,
            storage,
            queue,
            planner,
            tracker,
            settings,
        }
    }
}
