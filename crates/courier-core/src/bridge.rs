//! The distribution bridge: cross-instance fan-out through the broker.
//!
//! Each server instance is authoritative only for the connections it holds;
//! every routed frame is republished to the broker under the recipient's
//! topic (or the shared broadcast topic), and frames arriving from the broker
//! are handed back to the coordinator for local delivery only. The bridge
//! keeps exactly one subscription per identity with at least one local
//! connection, plus the constant broadcast subscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use courier_protocol::{codec, Frame, Identity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::CoordinatorHandle;
use crate::traits::Broker;

/// The shared topic carrying frames with no recipient.
pub const BROADCAST_TOPIC: &str = "broadcast";

/// The private broker topic for an identity.
#[must_use]
pub fn identity_topic(identity: Identity) -> String {
    format!("user:{identity}")
}

/// Bridges the coordinator to the publish/subscribe broker.
///
/// The subscription table is the one structure touched from two sides (the
/// coordinator's open/close requests and the listeners' own lifecycle), so
/// it sits behind a mutex; everything else is message passing.
pub struct Bridge {
    broker: Arc<dyn Broker>,
    coordinator: CoordinatorHandle,
    subs: Mutex<HashMap<String, CancellationToken>>,
}

impl Bridge {
    /// Create a bridge publishing through `broker` and delivering inbound
    /// frames via `coordinator`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, coordinator: CoordinatorHandle) -> Self {
        Self {
            broker,
            coordinator,
            subs: Mutex::new(HashMap::new()),
        }
    }

    /// Open the constant broadcast subscription. Called once at startup.
    pub fn watch_broadcast(&self) {
        self.watch(BROADCAST_TOPIC.to_string(), None);
    }

    /// Ensure a subscription for an identity's private topic exists.
    ///
    /// Called by the coordinator when an identity gains its first local
    /// connection. Opening an already-open subscription is a no-op.
    pub fn watch_identity(&self, identity: Identity) {
        self.watch(identity_topic(identity), Some(identity));
    }

    /// Cancel an identity's subscription.
    ///
    /// Called by the coordinator when an identity loses its last local
    /// connection. Returns `false` if the subscription was already gone;
    /// cancellation happens at most once per open.
    pub fn unwatch_identity(&self, identity: Identity) -> bool {
        let topic = identity_topic(identity);
        let cancel = { self.subs.lock().unwrap().remove(&topic) };
        match cancel {
            Some(cancel) => {
                cancel.cancel();
                debug!(%topic, "subscription cancelled");
                true
            }
            None => false,
        }
    }

    /// Number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Publish a routed frame on its recipient's topic, or on the broadcast
    /// topic when it has no recipient.
    pub fn publish_frame(&self, frame: &Frame) {
        let topic = match frame.to {
            Some(to) => identity_topic(to),
            None => BROADCAST_TOPIC.to_string(),
        };
        self.publish(topic, frame);
    }

    /// Publish a frame on a specific identity's topic.
    pub fn publish_to_identity(&self, identity: Identity, frame: &Frame) {
        self.publish(identity_topic(identity), frame);
    }

    fn watch(&self, topic: String, owner: Option<Identity>) {
        let mut subs = self.subs.lock().unwrap();
        if subs.contains_key(&topic) {
            return;
        }
        let cancel = CancellationToken::new();
        tokio::spawn(listen(
            Arc::clone(&self.broker),
            topic.clone(),
            owner,
            self.coordinator.clone(),
            cancel.clone(),
        ));
        subs.insert(topic, cancel);
    }

    /// Publishes run off the routing path; a broker failure is logged and
    /// routing degrades to local-only delivery.
    fn publish(&self, topic: String, frame: &Frame) {
        let payload = match codec::encode(frame) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!(%topic, error = %e, "frame not publishable");
                return;
            }
        };
        let broker = Arc::clone(&self.broker);
        tokio::spawn(async move {
            if let Err(e) = broker.publish(&topic, payload).await {
                warn!(%topic, error = %e, "broker publish failed; delivery stays local");
            }
        });
    }
}

/// Listener task for one subscription. Exits cooperatively on cancellation,
/// on the broker stream closing, or when the coordinator stops.
async fn listen(
    broker: Arc<dyn Broker>,
    topic: String,
    owner: Option<Identity>,
    coordinator: CoordinatorHandle,
    cancel: CancellationToken,
) {
    let mut subscription = tokio::select! {
        () = cancel.cancelled() => return,
        result = broker.subscribe(&topic) => match result {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(%topic, error = %e, "broker subscribe failed");
                return;
            }
        },
    };

    debug!(%topic, "subscription listener started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            maybe = subscription.messages.recv() => {
                let Some(payload) = maybe else {
                    debug!(%topic, "broker stream closed");
                    break;
                };
                let frame = match codec::decode(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(%topic, error = %e, "discarding undecodable broker payload");
                        continue;
                    }
                };
                if coordinator.broker_inbound(owner, frame).await.is_err() {
                    break;
                }
            }
        }
    }

    debug!(%topic, "subscription listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinatorHandle, Event};
    use crate::testing::RecordingBroker;
    use courier_protocol::FrameKind;
    use std::time::Duration;

    fn bridge_fixture() -> (
        Arc<Bridge>,
        Arc<RecordingBroker>,
        tokio::sync::mpsc::Receiver<Event>,
    ) {
        let (handle, events) = CoordinatorHandle::channel(16);
        let broker = Arc::new(RecordingBroker::new());
        let bridge = Arc::new(Bridge::new(broker.clone(), handle));
        (bridge, broker, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatch_cancels_exactly_once() {
        let (bridge, _broker, _events) = bridge_fixture();

        bridge.watch_identity(9);
        assert_eq!(bridge.subscription_count(), 1);

        assert!(bridge.unwatch_identity(9));
        assert!(!bridge.unwatch_identity(9));
        assert_eq!(bridge.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_twice_opens_single_subscription() {
        let (bridge, broker, _events) = bridge_fixture();

        bridge.watch_identity(9);
        bridge.watch_identity(9);
        assert_eq!(bridge.subscription_count(), 1);

        broker.wait_subscribed("user:9").await;
        assert_eq!(broker.subscribe_count("user:9"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_payloads_reach_coordinator() {
        let (bridge, broker, mut events) = bridge_fixture();

        bridge.watch_identity(9);
        broker.wait_subscribed("user:9").await;

        let encoded = codec::encode(&Frame::direct(7, 9, "hi")).unwrap();
        assert!(broker.inject("user:9", Bytes::from(encoded)).await);

        match events.recv().await.unwrap() {
            Event::BrokerInbound { owner, frame } => {
                assert_eq!(owner, Some(9));
                assert_eq!(frame.body, "hi");
            }
            other => panic!("expected broker-inbound event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_subscription_has_no_owner() {
        let (bridge, broker, mut events) = bridge_fixture();

        bridge.watch_broadcast();
        broker.wait_subscribed(BROADCAST_TOPIC).await;

        let encoded = codec::encode(&Frame::broadcast(7, "hey all")).unwrap();
        assert!(broker.inject(BROADCAST_TOPIC, Bytes::from(encoded)).await);

        match events.recv().await.unwrap() {
            Event::BrokerInbound { owner, .. } => assert_eq!(owner, None),
            other => panic!("expected broker-inbound event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_skipped() {
        let (bridge, broker, mut events) = bridge_fixture();

        bridge.watch_identity(9);
        broker.wait_subscribed("user:9").await;

        assert!(broker.inject("user:9", Bytes::from_static(b"not json")).await);
        let encoded = codec::encode(&Frame::ack(Some(5))).unwrap();
        assert!(broker.inject("user:9", Bytes::from(encoded)).await);

        match events.recv().await.unwrap() {
            Event::BrokerInbound { frame, .. } => assert_eq!(frame.kind, FrameKind::Ack),
            other => panic!("expected broker-inbound event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_listener_stops_consuming() {
        let (bridge, broker, _events) = bridge_fixture();

        bridge.watch_identity(9);
        broker.wait_subscribed("user:9").await;
        bridge.unwatch_identity(9);

        // The listener drops its stream at the next wait point; injection
        // starts failing once it has.
        let encoded = Bytes::from(codec::encode(&Frame::ack(Some(1))).unwrap());
        while broker.inject("user:9", encoded.clone()).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_frame_picks_topic_by_recipient() {
        let (bridge, broker, _events) = bridge_fixture();

        bridge.publish_frame(&Frame::direct(7, 9, "hi"));
        bridge.publish_frame(&Frame::broadcast(7, "hey all"));

        let published = broker.wait_publishes(2).await;
        assert!(published.iter().any(|(t, _)| t == "user:9"));
        assert!(published.iter().any(|(t, _)| t == BROADCAST_TOPIC));
    }
}
