//! Collaborator contracts consumed by the hub.
//!
//! The core never implements persistence, authentication, or a networked
//! broker; it talks to them through these traits. The transport seam at the
//! bottom of the file is what server binaries implement over their socket
//! type so the connection loops stay transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use courier_protocol::{Frame, Identity, MessageId, ProtocolError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Message store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message with the given id exists.
    #[error("message {0} not found")]
    NotFound(MessageId),

    /// Backend failure.
    #[error("storage failure: {0}")]
    Backend(String),
}

/// Persists chat messages and their delivery state.
///
/// Store failures are logged by callers and never block or reverse delivery;
/// routing and persistence are decoupled by design.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a frame, returning the assigned message id.
    async fn save(&self, frame: &Frame) -> Result<MessageId, StoreError>;

    /// Mark a persisted message as delivered. Idempotent.
    async fn mark_delivered(&self, message_id: MessageId) -> Result<(), StoreError>;
}

/// Credential resolution errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential is not recognized.
    #[error("invalid credential")]
    InvalidCredential,

    /// Resolver backend failure.
    #[error("resolver failure: {0}")]
    Backend(String),
}

/// Resolves a bearer credential to an authenticated identity.
///
/// Resolution failure aborts the transport upgrade before any registry state
/// exists.
#[async_trait]
pub trait AuthResolver: Send + Sync {
    /// Resolve a credential to an identity.
    async fn resolve(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Publish failed.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Subscribe failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Handle to an open broker subscription.
///
/// Dropping the receiver releases the subscription's broker-side resources.
#[derive(Debug)]
pub struct Subscription {
    /// Raw payloads published on the subscribed topic.
    pub messages: mpsc::Receiver<Bytes>,
}

/// The external publish/subscribe transport enabling cross-instance fan-out.
///
/// Publish failures degrade routing to local-only delivery; they are logged
/// and never abort the triggering request.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a topic.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BrokerError>;
}

/// Transport errors surfaced by the connection loops.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failed to send data.
    #[error("send failed: {0}")]
    Send(String),

    /// Failed to receive data.
    #[error("receive failed: {0}")]
    Recv(String),

    /// The peer sent a frame the codec rejected.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// One inbound transport event.
#[derive(Debug)]
pub enum Inbound {
    /// A decoded protocol frame.
    Frame(Frame),
    /// A liveness signal (pong or transport-level keepalive); carries no
    /// payload but renews the read deadline.
    Pong,
}

/// Receiving half of a client transport.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next inbound event.
    ///
    /// Returns `Ok(None)` when the peer closed the transport cleanly.
    async fn next_frame(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// Sending half of a client transport.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the peer.
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), TransportError>;

    /// Send a heartbeat ping to the peer.
    async fn send_ping(&mut self) -> Result<(), TransportError>;

    /// Close the transport. Errors during close are ignored.
    async fn close(&mut self);
}
