//! Codec for encoding and decoding Courier frames.
//!
//! The wire format is textual: one JSON object per message, bounded by a
//! maximum frame size.

use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {1}")]
    FrameTooLarge(usize, usize),

    /// JSON serialization error.
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Encode a frame to its wire representation.
///
/// # Errors
///
/// Returns an error if the encoded frame exceeds [`MAX_FRAME_SIZE`] or
/// serialization fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let encoded = serde_json::to_string(frame)?;

    if encoded.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(encoded.len(), MAX_FRAME_SIZE));
    }

    Ok(encoded)
}

/// Decode a frame from raw bytes, enforcing [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid frame.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    decode_limited(data, MAX_FRAME_SIZE)
}

/// Decode a frame from raw bytes with an explicit size bound.
///
/// Servers pass their configured per-connection frame limit here.
///
/// # Errors
///
/// Returns an error if the data exceeds `max_size` or is not a valid frame.
pub fn decode_limited(data: &[u8], max_size: usize) -> Result<Frame, ProtocolError> {
    if data.len() > max_size {
        return Err(ProtocolError::FrameTooLarge(data.len(), max_size));
    }

    let frame = serde_json::from_slice(data)?;
    Ok(frame)
}
