//! Frame types for the Courier protocol.
//!
//! A frame is one routed protocol message: a chat message, a room join or
//! leave, or a delivery acknowledgment. Frames travel as one JSON object per
//! WebSocket text message.

use serde::{Deserialize, Serialize};

/// An authenticated user id.
pub type Identity = u64;

/// A persisted message id, assigned by the message store.
pub type MessageId = u64;

/// Frame kind discriminator, serialized as the wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    /// A chat message, targeted, room-scoped, or broadcast.
    Message,
    /// Join the room named by `room_id`.
    Join,
    /// Leave the room named by `room_id`.
    Leave,
    /// Delivery acknowledgment for the message named by `id`.
    Ack,
}

/// A protocol frame.
///
/// `from` is always server-assigned from the authenticated connection; a
/// client-supplied value is overwritten before routing. `message_id` is
/// assigned by the message store on persistence and is immutable afterwards;
/// it is echoed back on `ack` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Frame kind.
    #[serde(rename = "type")]
    pub kind: FrameKind,

    /// Sender identity. Zero marks a server-synthesized frame.
    #[serde(default)]
    pub from: Identity,

    /// Recipient identity; omitted for broadcast and room frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Identity>,

    /// Room name for room-scoped frames.
    #[serde(rename = "room_id", default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// Persisted message id, echoed on `ack`.
    #[serde(rename = "id", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,

    /// Message body.
    #[serde(default)]
    pub body: String,
}

impl Frame {
    /// Create a chat frame targeted at a single identity.
    #[must_use]
    pub fn direct(from: Identity, to: Identity, body: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Message,
            from,
            to: Some(to),
            room: None,
            message_id: None,
            body: body.into(),
        }
    }

    /// Create a broadcast chat frame (no recipient).
    #[must_use]
    pub fn broadcast(from: Identity, body: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Message,
            from,
            to: None,
            room: None,
            message_id: None,
            body: body.into(),
        }
    }

    /// Create a room-scoped chat frame.
    #[must_use]
    pub fn room(from: Identity, room: impl Into<String>, body: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Message,
            from,
            to: None,
            room: Some(room.into()),
            message_id: None,
            body: body.into(),
        }
    }

    /// Create a join frame for a room.
    #[must_use]
    pub fn join(from: Identity, room: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Join,
            from,
            to: None,
            room: Some(room.into()),
            message_id: None,
            body: String::new(),
        }
    }

    /// Create a leave frame for a room.
    #[must_use]
    pub fn leave(from: Identity, room: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Leave,
            from,
            to: None,
            room: Some(room.into()),
            message_id: None,
            body: String::new(),
        }
    }

    /// Create an acknowledgment frame for a persisted message.
    ///
    /// Acks are synthesized by the hub (`from` is zero) or sent by clients to
    /// confirm receipt.
    #[must_use]
    pub fn ack(message_id: Option<MessageId>) -> Self {
        Frame {
            kind: FrameKind::Ack,
            from: 0,
            to: None,
            room: None,
            message_id,
            body: String::new(),
        }
    }

    /// Whether this frame targets a single identity.
    #[must_use]
    pub fn is_targeted(&self) -> bool {
        self.to.is_some()
    }
}
