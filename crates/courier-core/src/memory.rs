//! In-process broker and message store.
//!
//! These back single-instance deployments and tests. Multi-instance
//! deployments supply networked implementations of the same traits.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::{Frame, MessageId};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use crate::traits::{Broker, BrokerError, MessageStore, StoreError, Subscription};

const TOPIC_CAPACITY: usize = 1024;
const SUBSCRIPTION_CAPACITY: usize = 256;

/// In-process broker backed by one tokio broadcast channel per topic.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
}

impl MemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        // A topic without subscribers is not an error.
        let _ = self.topic_sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let mut source = self.topic_sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break; // Subscription dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "slow subscription lagged");
                        continue;
                    }
                }
            }
        });

        Ok(Subscription { messages: rx })
    }
}

/// A persisted message and its delivery state.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// The frame as persisted, with its assigned id.
    pub frame: Frame,
    /// Whether a delivery acknowledgment has been recorded.
    pub delivered: bool,
}

/// In-memory message store with a monotonically increasing id sequence.
#[derive(Default)]
pub struct MemoryStore {
    seq: AtomicU64,
    messages: DashMap<MessageId, StoredMessage>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a persisted message.
    #[must_use]
    pub fn get(&self, message_id: MessageId) -> Option<StoredMessage> {
        self.messages.get(&message_id).map(|m| m.value().clone())
    }

    /// Number of persisted messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, frame: &Frame) -> Result<MessageId, StoreError> {
        let message_id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut frame = frame.clone();
        frame.message_id = Some(message_id);
        self.messages.insert(
            message_id,
            StoredMessage {
                frame,
                delivered: false,
            },
        );
        Ok(message_id)
    }

    async fn mark_delivered(&self, message_id: MessageId) -> Result<(), StoreError> {
        match self.messages.get_mut(&message_id) {
            Some(mut stored) => {
                stored.delivered = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(message_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let broker = MemoryBroker::new();

        let mut sub1 = broker.subscribe("user:9").await.unwrap();
        let mut sub2 = broker.subscribe("user:9").await.unwrap();

        broker
            .publish("user:9", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(sub1.messages.recv().await.unwrap(), "hello");
        assert_eq!(sub2.messages.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::new();
        assert!(broker
            .publish("user:1", Bytes::from_static(b"x"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("user:1").await.unwrap();

        broker
            .publish("user:2", Bytes::from_static(b"elsewhere"))
            .await
            .unwrap();
        broker
            .publish("user:1", Bytes::from_static(b"here"))
            .await
            .unwrap();

        assert_eq!(sub.messages.recv().await.unwrap(), "here");
    }

    #[tokio::test]
    async fn test_store_assigns_sequential_ids() {
        let store = MemoryStore::new();
        let first = store.save(&Frame::direct(7, 9, "one")).await.unwrap();
        let second = store.save(&Frame::direct(7, 9, "two")).await.unwrap();
        assert_eq!(second, first + 1);

        let stored = store.get(first).unwrap();
        assert_eq!(stored.frame.message_id, Some(first));
        assert!(!stored.delivered);
    }

    #[tokio::test]
    async fn test_mark_delivered_is_idempotent() {
        let store = MemoryStore::new();
        let id = store.save(&Frame::direct(7, 9, "hi")).await.unwrap();

        store.mark_delivered(id).await.unwrap();
        store.mark_delivered(id).await.unwrap();
        assert!(store.get(id).unwrap().delivered);

        assert!(matches!(
            store.mark_delivered(id + 1).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
