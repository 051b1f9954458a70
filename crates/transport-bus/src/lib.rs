use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// Messages a topic buffers per receiver. A receiver further behind than
/// this loses the oldest ones.
const DEFAULT_CAPACITY: usize = 256;

/// One message on a topic. `origin` names the publisher so subscribers can
/// recognise their own traffic; the medium delivers it to everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub origin: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus topic must not be empty")]
    InvalidTopic,
}

pub type BusResult<T> = Result<T, BusError>;

/// Topic-scoped broadcast medium. Every subscriber of a topic, the
/// publisher's own subscription included, receives every message published
/// on it after the subscription was taken.
pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>>;
    fn publish(&self, topic: &str, origin: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus: one `tokio::sync::broadcast` channel per topic.
#[derive(Debug)]
pub struct LocalBus {
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: parking_lot::RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Shuts the medium down. Pending receivers observe `Closed` once drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> BusResult<broadcast::Sender<BusMessage>> {
        if topic.is_empty() {
            return Err(BusError::InvalidTopic);
        }
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if let Some(sender) = self.topics.read().get(topic) {
            return Ok(sender.clone());
        }
        let mut guard = self.topics.write();
        Ok(guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<BusMessage>> {
        Ok(self.sender_for(topic)?.subscribe())
    }

    fn publish(&self, topic: &str, origin: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic)?;
        // A topic nobody listens to swallows the message, like a real broadcast.
        let _ = sender.send(BusMessage {
            topic: topic.to_string(),
            origin: origin.to_string(),
            payload,
        });
        Ok(())
    }
}
