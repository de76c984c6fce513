//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime message hub.
//!
//! This crate defines the textual protocol spoken between Courier clients and
//! servers: one JSON object per message, with a bounded frame size.
//!
//! ## Frame Kinds
//!
//! - `message` - A chat message (targeted, room-scoped, or broadcast)
//! - `join` / `leave` - Room membership
//! - `ack` - Delivery acknowledgment, echoing the persisted message id
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! // Create a targeted chat frame using the helper method
//! let frame = Frame::direct(7, 9, "hi");
//!
//! // Encode and decode
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(encoded.as_bytes()).unwrap();
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{Frame, FrameKind, Identity, MessageId};
