//! Shared test doubles for the core crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::{Frame, MessageId};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::traits::{Broker, BrokerError, MessageStore, StoreError, Subscription};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(5);

/// Broker double recording publishes and handing out injectable streams.
pub(crate) struct RecordingBroker {
    published: Mutex<Vec<(String, Bytes)>>,
    senders: Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>,
    subscribes: Mutex<Vec<String>>,
}

impl RecordingBroker {
    pub(crate) fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            senders: Mutex::new(HashMap::new()),
            subscribes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    /// Wait until at least `n` publishes were recorded, returning them all.
    pub(crate) async fn wait_publishes(&self, n: usize) -> Vec<(String, Bytes)> {
        timeout(WAIT, async {
            loop {
                {
                    let published = self.published.lock().unwrap();
                    if published.len() >= n {
                        return published.clone();
                    }
                }
                sleep(POLL).await;
            }
        })
        .await
        .expect("timed out waiting for broker publishes")
    }

    pub(crate) fn subscribe_count(&self, topic: &str) -> usize {
        self.subscribes
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == topic)
            .count()
    }

    /// Wait until a subscription for `topic` was opened.
    pub(crate) async fn wait_subscribed(&self, topic: &str) {
        timeout(WAIT, async {
            loop {
                if self.subscribe_count(topic) > 0 {
                    return;
                }
                sleep(POLL).await;
            }
        })
        .await
        .expect("timed out waiting for broker subscription")
    }

    /// Push a payload into every live subscription for `topic`. Returns
    /// `false` when no subscription accepted it.
    pub(crate) async fn inject(&self, topic: &str, payload: Bytes) -> bool {
        let senders: Vec<mpsc::Sender<Bytes>> = self
            .senders
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        let mut accepted = false;
        for tx in senders {
            if tx.send(payload.clone()).await.is_ok() {
                accepted = true;
            }
        }
        accepted
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::channel(16);
        self.senders
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        self.subscribes.lock().unwrap().push(topic.to_string());
        Ok(Subscription { messages: rx })
    }
}

/// Store double recording saves and delivered-markings.
pub(crate) struct RecordingStore {
    seq: AtomicU64,
    saved: Mutex<Vec<Frame>>,
    acked: Mutex<Vec<MessageId>>,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            saved: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn acked(&self) -> Vec<MessageId> {
        self.acked.lock().unwrap().clone()
    }

    /// Wait until at least `n` delivered-markings were recorded.
    pub(crate) async fn wait_acked(&self, n: usize) -> Vec<MessageId> {
        timeout(WAIT, async {
            loop {
                {
                    let acked = self.acked.lock().unwrap();
                    if acked.len() >= n {
                        return acked.clone();
                    }
                }
                sleep(POLL).await;
            }
        })
        .await
        .expect("timed out waiting for delivered-markings")
    }
}

#[async_trait]
impl MessageStore for RecordingStore {
    async fn save(&self, frame: &Frame) -> Result<MessageId, StoreError> {
        self.saved.lock().unwrap().push(frame.clone());
        Ok(self.seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn mark_delivered(&self, message_id: MessageId) -> Result<(), StoreError> {
        self.acked.lock().unwrap().push(message_id);
        Ok(())
    }
}
