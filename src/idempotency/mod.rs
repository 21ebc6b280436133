use log::debug;
use std::sync::Arc;

use crate::store::{EngineStore, StoreError};

/// Dedup guard over the processed-events record. Checked before any mutation
/// begins; marked after the last durable mutation and before dispatch, so a
/// crash between mark and dispatch costs at most one duplicate reply.
///
/// If the backing store is unreachable the answer is an error, never a
/// guess: the event stays on the queue and is retried later.
pub struct IdempotencyGuard {
    store: Arc<dyn EngineStore>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    pub async fn has_processed(&self, event_key: &str) -> Result<bool, StoreError> {
        let processed = self.store.has_processed(event_key).await?;
        if processed {
            debug!("Duplicate event dropped: {event_key}");
        }
        Ok(processed)
    }

    pub async fn mark_processed(&self, event_key: &str) -> Result<(), StoreError> {
        self.store.mark_processed(event_key).await
    }
}
