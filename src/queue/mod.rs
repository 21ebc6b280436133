use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::channels::ChannelType;

/// One customer-facing event as consumed from the inbound queue. Immutable
/// once read; the channel-native message ID is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub channel: ChannelType,
    pub identifier: String,
    pub content: String,
    pub channel_message_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundEvent {
    /// Channel-native IDs are only unique per provider, so the dedup key
    /// namespaces them by channel.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.channel, self.channel_message_id)
    }

    /// Routing key. All events for one customer-facing identifier land on
    /// the same partition, which is what guarantees per-customer ordering.
    pub fn partition_key(&self) -> &str {
        &self.identifier
    }
}

/// An event handed to a worker, with its redelivery count.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: InboundEvent,
    pub attempt: u32,
}

struct PartitionInner {
    queue: VecDeque<InboundEvent>,
    /// Redelivery count for the event currently at the head.
    head_attempts: u32,
}

/// One ordered partition. `next()` peeks the head without removing it, so a
/// worker crash before `ack` causes redelivery (at-least-once, in order).
pub struct PartitionBuffer {
    inner: Mutex<PartitionInner>,
    notify: Notify,
}

impl PartitionBuffer {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PartitionInner {
                queue: VecDeque::new(),
                head_attempts: 0,
            }),
            notify: Notify::new(),
        }
    }

    async fn push(&self, event: InboundEvent) {
        let mut inner = self.inner.lock().await;
        inner.queue.push_back(event);
        drop(inner);
        self.notify.notify_one();
    }

    /// Waits for and returns the head event without consuming it. Each call
    /// for the same head increments its attempt count.
    pub async fn next(&self) -> Delivery {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(event) = inner.queue.front().cloned() {
                    inner.head_attempts += 1;
                    return Delivery {
                        event,
                        attempt: inner.head_attempts,
                    };
                }
            }
            self.notify.notified().await;
        }
    }

    /// Commits the head event. A mismatched key is a no-op, which makes acks
    /// safe to replay.
    pub async fn ack(&self, dedup_key: &str) {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .queue
            .front()
            .map(|e| e.dedup_key() == dedup_key)
            .unwrap_or(false);
        if matches {
            inner.queue.pop_front();
            inner.head_attempts = 0;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-process stand-in for the durable partitioned queue. The real queue
/// client is an external collaborator; this implements the same contract
/// (key-hashed partitions, per-partition ordering, ack-based redelivery)
/// for the embedded and test configurations.
pub struct PartitionedQueue {
    partitions: Vec<Arc<PartitionBuffer>>,
}

impl PartitionedQueue {
    pub fn new(partitions: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| Arc::new(PartitionBuffer::new()))
            .collect();
        Self { partitions }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition(&self, index: usize) -> Arc<PartitionBuffer> {
        Arc::clone(&self.partitions[index])
    }

    pub fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions.len() as u64) as usize
    }

    pub async fn publish(&self, event: InboundEvent) {
        let index = self.partition_for(event.partition_key());
        self.partitions[index].push(event).await;
    }

    pub async fn depth(&self) -> usize {
        let mut total = 0;
        for p in &self.partitions {
            total += p.len().await;
        }
        total
    }
}
