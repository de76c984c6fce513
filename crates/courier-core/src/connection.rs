//! Connection identity, state, and the per-connection I/O loops.
//!
//! Each client connection runs two tasks: a read loop that parses inbound
//! frames and submits them to the coordinator, and a write loop that drains
//! the bounded outbound queue to the transport and emits heartbeat pings.
//! Neither task touches coordinator state directly; all registry mutation
//! goes through event submission.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_protocol::{Frame, FrameKind, Identity};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::coordinator::CoordinatorHandle;
use crate::traits::{FrameSink, FrameStream, Inbound, MessageStore};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection id.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle states.
///
/// `Open` begins after handshake and successful registration. `Closing`
/// begins on the first I/O error, deadline expiry, or explicit unregister.
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Error returned when a frame cannot be queued for a connection.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The outbound queue is at capacity; the peer is not keeping up.
    #[error("outbound queue full")]
    Full,

    /// The outbound queue was closed; the connection is going away.
    #[error("outbound queue closed")]
    Closed,
}

/// Timing and capacity knobs for a connection's I/O loops.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Period between outbound heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Inbound liveness deadline; any inbound event renews it.
    pub read_deadline: Duration,
    /// Deadline for a single outbound send.
    pub write_deadline: Duration,
    /// Capacity of the bounded outbound queue.
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            read_deadline: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// Shared handle to a live connection.
///
/// The coordinator owns the authoritative copy through its registry; the
/// connection's own tasks hold clones used only for state transitions. The
/// handle never reaches into coordinator state.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    outbound: mpsc::Sender<Arc<Frame>>,
    state: Arc<AtomicU8>,
}

impl ConnectionHandle {
    /// Create a handle and the receiving end of its bounded outbound queue.
    ///
    /// The receiver is consumed by the connection's write loop.
    #[must_use]
    pub fn channel(
        identity: Identity,
        queue_capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<Frame>>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = Self {
            id: ConnectionId::next(),
            identity,
            outbound: tx,
            state: Arc::new(AtomicU8::new(ConnState::Connecting as u8)),
        };
        (handle, rx)
    }

    /// The connection's id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The authenticated identity bound to this connection.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition `Connecting -> Open` after successful registration.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            ConnState::Connecting as u8,
            ConnState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Begin teardown. Returns `true` only for the first caller; teardown is
    /// idempotent and later callers see `false`.
    pub fn begin_close(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= ConnState::Closing as u8 {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Mark the connection fully closed. Terminal.
    pub fn mark_closed(&self) {
        self.state.store(ConnState::Closed as u8, Ordering::Release);
    }

    /// Queue a frame for delivery without blocking.
    ///
    /// A full queue means the peer is not draining fast enough; the caller
    /// tears the connection down rather than waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or already closed.
    pub fn enqueue(&self, frame: Arc<Frame>) -> Result<(), EnqueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Run a connection's inbound loop until the transport closes, errors, or the
/// liveness deadline expires.
///
/// Each frame has its sender stamped from the authenticated identity before
/// anything else; the value on the wire is never trusted. `message` frames
/// are persisted first so the assigned id travels with the frame, then every
/// frame is submitted to the coordinator in arrival order. On exit the loop
/// submits the unregister event that ends the write loop.
pub async fn read_loop<S>(
    mut stream: S,
    conn: ConnectionHandle,
    coordinator: CoordinatorHandle,
    store: Arc<dyn MessageStore>,
    config: ConnectionConfig,
) where
    S: FrameStream,
{
    loop {
        let inbound = match timeout(config.read_deadline, stream.next_frame()).await {
            Err(_) => {
                debug!(conn = %conn.id(), identity = conn.identity(), "read deadline expired");
                break;
            }
            Ok(Err(e)) => {
                debug!(conn = %conn.id(), error = %e, "inbound transport error");
                break;
            }
            Ok(Ok(None)) => {
                debug!(conn = %conn.id(), "peer closed connection");
                break;
            }
            Ok(Ok(Some(inbound))) => inbound,
        };

        let mut frame = match inbound {
            // Deadline already renewed by re-arming the timeout above.
            Inbound::Pong => continue,
            Inbound::Frame(frame) => frame,
        };

        frame.from = conn.identity();

        if frame.kind == FrameKind::Message {
            match store.save(&frame).await {
                Ok(message_id) => frame.message_id = Some(message_id),
                Err(e) => {
                    warn!(conn = %conn.id(), error = %e, "message save failed");
                }
            }
        }

        if coordinator.route(conn.id(), frame).await.is_err() {
            break;
        }
    }

    conn.begin_close();
    let _ = coordinator.unregister(conn.id()).await;
}

/// Run a connection's outbound loop: drain the bounded queue to the
/// transport and emit heartbeat pings on a fixed interval.
///
/// The loop ends when the coordinator closes the queue, a send fails, or a
/// send misses the write deadline. The transport is closed on the way out.
pub async fn write_loop<S>(
    mut sink: S,
    conn: ConnectionHandle,
    mut outbound: mpsc::Receiver<Arc<Frame>>,
    config: ConnectionConfig,
) where
    S: FrameSink,
{
    let start = Instant::now() + config.heartbeat_interval;
    let mut heartbeat = interval_at(start, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(frame) = maybe else {
                    // Queue closed by the coordinator.
                    break;
                };
                match timeout(config.write_deadline, sink.send_frame(&frame)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(conn = %conn.id(), error = %e, "outbound send failed");
                        break;
                    }
                    Err(_) => {
                        debug!(conn = %conn.id(), "write deadline expired");
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                match timeout(config.write_deadline, sink.send_ping()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(conn = %conn.id(), error = %e, "ping failed");
                        break;
                    }
                    Err(_) => {
                        debug!(conn = %conn.id(), "ping write deadline expired");
                        break;
                    }
                }
            }
        }
    }

    conn.begin_close();
    sink.close().await;
    conn.mark_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinatorHandle, Event};
    use crate::traits::{StoreError, TransportError};
    use async_trait::async_trait;
    use courier_protocol::MessageId;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct ScriptedStream {
        events: VecDeque<Result<Option<Inbound>, TransportError>>,
    }

    impl ScriptedStream {
        fn new(events: Vec<Result<Option<Inbound>, TransportError>>) -> Self {
            Self {
                events: events.into(),
            }
        }
    }

    #[async_trait]
    impl FrameStream for ScriptedStream {
        async fn next_frame(&mut self) -> Result<Option<Inbound>, TransportError> {
            match self.events.pop_front() {
                Some(event) => event,
                // Script exhausted: hang until the read deadline fires.
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Clone, Default)]
    struct ProbeSink {
        frames: Arc<Mutex<Vec<Frame>>>,
        pings: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameSink for ProbeSink {
        async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct SeqStore {
        next: AtomicU64,
        fail: bool,
    }

    #[async_trait]
    impl MessageStore for SeqStore {
        async fn save(&self, _frame: &Frame) -> Result<MessageId, StoreError> {
            if self.fail {
                return Err(StoreError::Backend("down".into()));
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn mark_delivered(&self, _message_id: MessageId) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_stamps_sender_and_persists() {
        let (handle, _rx) = ConnectionHandle::channel(7, 8);
        let (coordinator, mut events) = CoordinatorHandle::channel(16);
        let store = Arc::new(SeqStore::default());

        // Client-supplied sender (999) must be overwritten with the
        // authenticated identity.
        let wire = Frame::direct(999, 9, "hi");
        let stream = ScriptedStream::new(vec![Ok(Some(Inbound::Frame(wire)))]);

        read_loop(stream, handle.clone(), coordinator, store, test_config()).await;

        match events.recv().await.unwrap() {
            Event::Route { source, frame } => {
                assert_eq!(source, handle.id());
                assert_eq!(frame.from, 7);
                assert_eq!(frame.message_id, Some(1));
            }
            other => panic!("expected route event, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            Event::Unregister(id) => assert_eq!(id, handle.id()),
            other => panic!("expected unregister event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_routes_without_id_when_save_fails() {
        let (handle, _rx) = ConnectionHandle::channel(7, 8);
        let (coordinator, mut events) = CoordinatorHandle::channel(16);
        let store = Arc::new(SeqStore {
            fail: true,
            ..SeqStore::default()
        });

        let stream = ScriptedStream::new(vec![Ok(Some(Inbound::Frame(Frame::direct(
            7, 9, "hi",
        ))))]);

        read_loop(stream, handle, coordinator, store, test_config()).await;

        match events.recv().await.unwrap() {
            Event::Route { frame, .. } => assert!(frame.message_id.is_none()),
            other => panic!("expected route event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_deadline_unregisters() {
        let (handle, _rx) = ConnectionHandle::channel(7, 8);
        let (coordinator, mut events) = CoordinatorHandle::channel(16);
        let store = Arc::new(SeqStore::default());

        // Empty script: the stream never yields, so the deadline must fire.
        let stream = ScriptedStream::new(vec![]);
        read_loop(stream, handle.clone(), coordinator, store, test_config()).await;

        assert_eq!(handle.state(), ConnState::Closing);
        match events.recv().await.unwrap() {
            Event::Unregister(id) => assert_eq!(id, handle.id()),
            other => panic!("expected unregister event, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_loop_breaks_on_malformed_frame() {
        let (handle, _rx) = ConnectionHandle::channel(7, 8);
        let (coordinator, mut events) = CoordinatorHandle::channel(16);
        let store = Arc::new(SeqStore::default());

        let malformed = courier_protocol::decode(b"not json").unwrap_err();
        let stream = ScriptedStream::new(vec![Err(TransportError::Protocol(malformed))]);
        read_loop(stream, handle, coordinator, store, test_config()).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            Event::Unregister(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_drains_queue_and_closes() {
        let (handle, rx) = ConnectionHandle::channel(7, 8);
        let sink = ProbeSink::default();
        let probe = sink.clone();

        handle.enqueue(Arc::new(Frame::direct(1, 7, "one"))).unwrap();
        handle.enqueue(Arc::new(Frame::direct(2, 7, "two"))).unwrap();

        let conn = handle.clone();
        let task = tokio::spawn(write_loop(sink, conn, rx, test_config()));
        // Dropping the last sender closes the queue, as the coordinator does
        // on unregister.
        drop(handle);
        task.await.unwrap();

        let frames = probe.frames.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].body, "one");
        assert_eq!(frames[1].body, "two");
        assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_loop_sends_heartbeats() {
        let (handle, rx) = ConnectionHandle::channel(7, 8);
        let sink = ProbeSink::default();
        let probe = sink.clone();

        let conn = handle.clone();
        let task = tokio::spawn(write_loop(sink, conn, rx, test_config()));

        // Idle queue: paused time advances straight to the heartbeat ticks.
        while probe.pings.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }

        drop(handle);
        task.await.unwrap();
        assert!(probe.pings.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_enqueue_full_queue() {
        let (handle, _rx) = ConnectionHandle::channel(7, 1);
        handle.enqueue(Arc::new(Frame::ack(Some(1)))).unwrap();
        assert!(matches!(
            handle.enqueue(Arc::new(Frame::ack(Some(2)))),
            Err(EnqueueError::Full)
        ));
    }

    #[test]
    fn test_state_transitions_idempotent() {
        let (handle, _rx) = ConnectionHandle::channel(7, 1);
        assert_eq!(handle.state(), ConnState::Connecting);

        handle.mark_open();
        assert_eq!(handle.state(), ConnState::Open);

        assert!(handle.begin_close());
        assert!(!handle.begin_close());
        assert_eq!(handle.state(), ConnState::Closing);

        handle.mark_closed();
        assert_eq!(handle.state(), ConnState::Closed);
        assert!(!handle.begin_close());
    }
}
