//! # courier-core
//!
//! Coordinator, connection loops, and distribution bridge for the Courier
//! realtime message hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Coordinator** - single serialized owner of the connection registry,
//!   identity index, and room index
//! - **Connection** - per-connection read/write loops with heartbeat
//!   liveness and a bounded, non-blocking outbound queue
//! - **Bridge** - per-identity broker subscriptions and cross-instance
//!   republishing
//! - **Traits** - contracts for the message store, auth resolver, broker,
//!   and the transport seam servers implement
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  events  ┌─────────────┐  publish  ┌────────────┐
//! │ Connection │─────────▶│ Coordinator │──────────▶│   Bridge   │
//! └────────────┘          └─────────────┘           └────────────┘
//!       ▲                        ▲                        │
//!       │       deliver          │    broker-inbound      │
//!       └────────────────────────┴────────────────────────┘
//! ```
//!
//! Connections, the upgrade endpoint, and broker listeners never touch
//! coordinator-owned state; everything flows through event submission, so
//! the routing hot path needs no locks.

pub mod bridge;
pub mod connection;
pub mod coordinator;
pub mod memory;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{identity_topic, Bridge, BROADCAST_TOPIC};
pub use connection::{
    read_loop, write_loop, ConnState, ConnectionConfig, ConnectionHandle, ConnectionId,
    EnqueueError,
};
pub use coordinator::{
    Coordinator, CoordinatorClosed, CoordinatorHandle, Event, DEFAULT_EVENT_CAPACITY,
};
pub use memory::{MemoryBroker, MemoryStore, StoredMessage};
pub use traits::{
    AuthError, AuthResolver, Broker, BrokerError, FrameSink, FrameStream, Inbound, MessageStore,
    StoreError, Subscription, TransportError,
};
