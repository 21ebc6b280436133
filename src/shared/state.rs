use std::sync::Arc;

use crate::config::AppConfig;
use crate::queue::PartitionedQueue;
use crate::store::EngineStore;

/// Shared state for the HTTP surface. All cross-event state lives in the
/// store; nothing here is per-worker.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn EngineStore>,
    pub queue: Arc<PartitionedQueue>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
        }
    }
}
