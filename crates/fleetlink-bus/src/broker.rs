//! Topic-based publish/subscribe.
//!
//! [`Bus`] is the seam every component publishes and subscribes through.
//! [`MemoryBus`] is an in-process broker backed by per-subscriber bounded
//! channels: a publish fans out to every live subscriber of the exact
//! topic, dropping the message for subscribers whose queue is full.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::BusError;

/// Per-subscriber queue depth before messages are dropped.
const SUBSCRIBER_QUEUE: usize = 256;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Receiving side of one subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    /// Next message, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Publish/subscribe transport seam.
#[async_trait]
pub trait Bus: Send + Sync + std::fmt::Debug {
    /// Publish `payload` on `topic`.
    ///
    /// An error means the transport could not accept the message; it does
    /// not mean every subscriber received it.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to exactly `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

/// In-process broker.
///
/// Cloning yields handles to the same topic table, so one `MemoryBus`
/// stands in for a shared external broker within a process.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<BusMessage>>>>>,
}

impl MemoryBus {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BusError> {
        let senders = {
            let mut topics = self
                .topics
                .lock()
                .map_err(|_| BusError::Disconnected("broker lock poisoned".into()))?;
            let Some(senders) = topics.get_mut(topic) else {
                // No subscribers is not a failure; the message just has
                // nowhere to go.
                return Ok(());
            };
            senders.retain(|s| !s.is_closed());
            senders.clone()
        };

        for sender in senders {
            let message = BusMessage { topic: topic.to_owned(), payload: payload.clone() };
            if sender.try_send(message).is_err() {
                tracing::trace!(topic, "dropping message for slow subscriber");
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut topics = self
            .topics
            .lock()
            .map_err(|_| BusError::Disconnected("broker lock poisoned".into()))?;
        topics.entry(topic.to_owned()).or_default().push(tx);
        Ok(Subscription { rx })
    }
}
