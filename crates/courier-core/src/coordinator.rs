//! The coordinator: single serialized authority over the live registry.
//!
//! All mutations of the registry, the identity index, and the room index
//! happen on one event loop consuming register/unregister/route events, so
//! the routing hot path needs no locks. Connections, the upgrade endpoint,
//! and broker listeners interact with it only through [`CoordinatorHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use courier_protocol::{Frame, FrameKind, Identity, MessageId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::Bridge;
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::traits::MessageStore;

/// Default capacity of the coordinator event queue.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Error returned when the coordinator event loop is no longer running.
#[derive(Debug, Error)]
#[error("coordinator event loop has stopped")]
pub struct CoordinatorClosed;

/// Events consumed by the coordinator loop.
#[derive(Debug)]
pub enum Event {
    /// A new authenticated connection.
    Register(ConnectionHandle),
    /// A connection is going away. Idempotent.
    Unregister(ConnectionId),
    /// A frame read from a local connection.
    Route {
        /// The connection the frame arrived on.
        source: ConnectionId,
        /// The frame, with `from` already stamped by the read loop.
        frame: Frame,
    },
    /// A frame that arrived from the broker. Delivered locally only, never
    /// republished.
    BrokerInbound {
        /// Identity owning the subscription the frame arrived on; `None` for
        /// the shared broadcast topic.
        owner: Option<Identity>,
        /// The decoded frame.
        frame: Frame,
    },
}

/// Cloneable handle used to submit events to the coordinator.
///
/// Events from one submitter are processed in submission order; the loop
/// itself consumes the queue strictly FIFO.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<Event>,
}

impl CoordinatorHandle {
    /// Create a handle and the event queue consumed by [`Coordinator::run`].
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (events, rx) = mpsc::channel(capacity);
        (Self { events }, rx)
    }

    /// Submit a registration for a new connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator has stopped.
    pub async fn register(&self, conn: ConnectionHandle) -> Result<(), CoordinatorClosed> {
        self.submit(Event::Register(conn)).await
    }

    /// Submit an unregistration for a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator has stopped.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), CoordinatorClosed> {
        self.submit(Event::Unregister(id)).await
    }

    /// Submit a frame read from a local connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator has stopped.
    pub async fn route(&self, source: ConnectionId, frame: Frame) -> Result<(), CoordinatorClosed> {
        self.submit(Event::Route { source, frame }).await
    }

    /// Submit a frame that arrived from the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator has stopped.
    pub async fn broker_inbound(
        &self,
        owner: Option<Identity>,
        frame: Frame,
    ) -> Result<(), CoordinatorClosed> {
        self.submit(Event::BrokerInbound { owner, frame }).await
    }

    async fn submit(&self, event: Event) -> Result<(), CoordinatorClosed> {
        self.events.send(event).await.map_err(|_| CoordinatorClosed)
    }
}

/// The message-routing hub.
///
/// Owns the registry of live connections, the identity index (one identity
/// may hold several simultaneous connections), and the room index. Routed
/// frames are delivered to local connections with a non-blocking enqueue and
/// republished through the [`Bridge`] so peers on other instances converge.
pub struct Coordinator {
    registry: HashMap<ConnectionId, ConnectionHandle>,
    identities: HashMap<Identity, HashSet<ConnectionId>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
    bridge: Arc<Bridge>,
    store: Arc<dyn MessageStore>,
}

impl Coordinator {
    /// Create a coordinator routing through the given bridge and store.
    #[must_use]
    pub fn new(bridge: Arc<Bridge>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            registry: HashMap::new(),
            identities: HashMap::new(),
            rooms: HashMap::new(),
            bridge,
            store,
        }
    }

    /// Run the event loop until every [`CoordinatorHandle`] is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        info!("coordinator event loop started");
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        info!("coordinator event loop stopped");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Register(conn) => self.handle_register(conn),
            Event::Unregister(id) => self.handle_unregister(id),
            Event::Route { source, frame } => self.handle_route(source, frame),
            Event::BrokerInbound { owner, frame } => self.handle_broker_inbound(owner, frame),
        }
    }

    fn handle_register(&mut self, conn: ConnectionHandle) {
        let id = conn.id();
        let identity = conn.identity();
        conn.mark_open();
        self.registry.insert(id, conn);

        let members = self.identities.entry(identity).or_default();
        let first = members.is_empty();
        members.insert(id);
        if first {
            self.bridge.watch_identity(identity);
        }

        debug!(conn = %id, identity, total = self.registry.len(), "connection registered");
    }

    fn handle_unregister(&mut self, id: ConnectionId) {
        if self.remove_connection(id) {
            debug!(conn = %id, total = self.registry.len(), "connection unregistered");
        }
    }

    fn handle_route(&mut self, source: ConnectionId, frame: Frame) {
        match frame.kind {
            FrameKind::Join => {
                let Some(room) = frame.room else { return };
                if !self.registry.contains_key(&source) {
                    return;
                }
                self.rooms.entry(room).or_default().insert(source);
            }
            FrameKind::Leave => {
                let Some(room) = frame.room.as_deref() else { return };
                if let Some(members) = self.rooms.get_mut(room) {
                    members.remove(&source);
                    if members.is_empty() {
                        self.rooms.remove(room);
                    }
                }
            }
            FrameKind::Ack => {
                // Client acks drive delivered-marking only; they are never
                // re-routed or republished.
                if let Some(message_id) = frame.message_id {
                    self.spawn_mark_delivered(message_id);
                }
            }
            FrameKind::Message => {
                if let Some(room) = frame.room.clone() {
                    // Room delivery is local-only best effort.
                    self.deliver_to_room(&room, &Arc::new(frame));
                    return;
                }

                // Publish regardless of local delivery so other instances
                // converge.
                self.bridge.publish_frame(&frame);

                if let Some(to) = frame.to {
                    let sender = frame.from;
                    let message_id = frame.message_id;
                    let delivered = self.deliver_to_identity(to, &Arc::new(frame));
                    if delivered > 0 {
                        if let Some(message_id) = message_id {
                            self.spawn_mark_delivered(message_id);
                        }
                        if sender != 0 {
                            let ack = Arc::new(Frame::ack(message_id));
                            self.deliver_to_identity(sender, &ack);
                            self.bridge.publish_to_identity(sender, &ack);
                        }
                    }
                } else {
                    self.deliver_to_all(&Arc::new(frame));
                }
            }
        }
    }

    fn handle_broker_inbound(&mut self, owner: Option<Identity>, frame: Frame) {
        match frame.kind {
            FrameKind::Ack => {
                if let Some(message_id) = frame.message_id {
                    self.spawn_mark_delivered(message_id);
                }
                if let Some(owner) = owner {
                    self.deliver_to_identity(owner, &Arc::new(frame));
                }
            }
            FrameKind::Message => {
                if let Some(to) = frame.to {
                    let sender = frame.from;
                    let message_id = frame.message_id;
                    let delivered = self.deliver_to_identity(to, &Arc::new(frame));
                    // The origin instance marks the message delivered when
                    // this ack arrives on the sender's topic; the frame
                    // itself is never republished.
                    if delivered > 0 && sender != 0 && message_id.is_some() {
                        self.bridge
                            .publish_to_identity(sender, &Frame::ack(message_id));
                    }
                } else {
                    self.deliver_to_all(&Arc::new(frame));
                }
            }
            FrameKind::Join | FrameKind::Leave => {
                debug!(kind = ?frame.kind, "ignoring room frame from broker");
            }
        }
    }

    /// Deliver a frame to every local connection of an identity, returning
    /// the number of successful enqueues. Connections whose queue is full or
    /// closed are torn down before this returns.
    fn deliver_to_identity(&mut self, identity: Identity, frame: &Arc<Frame>) -> usize {
        let Some(members) = self.identities.get(&identity) else {
            return 0;
        };
        let targets: Vec<ConnectionId> = members.iter().copied().collect();
        self.deliver_to_targets(&targets, frame)
    }

    fn deliver_to_all(&mut self, frame: &Arc<Frame>) -> usize {
        let targets: Vec<ConnectionId> = self.registry.keys().copied().collect();
        self.deliver_to_targets(&targets, frame)
    }

    fn deliver_to_room(&mut self, room: &str, frame: &Arc<Frame>) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        let targets: Vec<ConnectionId> = members.iter().copied().collect();
        self.deliver_to_targets(&targets, frame)
    }

    fn deliver_to_targets(&mut self, targets: &[ConnectionId], frame: &Arc<Frame>) -> usize {
        let mut delivered = 0;
        let mut stalled = Vec::new();
        for id in targets {
            let Some(conn) = self.registry.get(id) else {
                continue;
            };
            match conn.enqueue(Arc::clone(frame)) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(conn = %id, error = %e, "dropping unresponsive connection");
                    stalled.push(*id);
                }
            }
        }
        for id in stalled {
            self.remove_connection(id);
        }
        delivered
    }

    /// Remove a connection from the registry and all indexes. Returns `false`
    /// if the connection was already gone.
    fn remove_connection(&mut self, id: ConnectionId) -> bool {
        let Some(conn) = self.registry.remove(&id) else {
            return false;
        };
        conn.begin_close();

        let identity = conn.identity();
        if let Some(members) = self.identities.get_mut(&identity) {
            members.remove(&id);
            if members.is_empty() {
                self.identities.remove(&identity);
                self.bridge.unwatch_identity(identity);
            }
        }

        self.rooms.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });

        // Dropping the registry's sender clone closes the outbound queue,
        // which ends the connection's write loop.
        true
    }

    fn spawn_mark_delivered(&self, message_id: MessageId) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.mark_delivered(message_id).await {
                warn!(message_id, error = %e, "delivered-marking failed");
            }
        });
    }
}
