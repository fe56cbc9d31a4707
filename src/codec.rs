//! LSP wire codec: converts between `Frame` and the JSON bytes carried in a
//! single UDP datagram.
//!
//! Unlike a length-prefixed stream codec, each datagram carries exactly one
//! frame, so there is no framing/buffering concern here — only
//! serialization. Malformed datagrams (bad JSON, truncated, not valid
//! UTF-8) decode to `CodecError` and are discarded by the caller; they never
//! reach the connection state machine.

use crate::frame::Frame;
use thiserror::Error;

/// Maximum datagram size we will attempt to decode. Chosen with headroom
/// over a typical MTU-sized payload once JSON key overhead is accounted for.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("datagram exceeds maximum size of {MAX_DATAGRAM_SIZE} bytes")]
    TooLarge,
}

/// Encodes a frame to its wire representation.
pub fn encode(frame: &Frame) -> Vec<u8> {
    serde_json::to_vec(frame).expect("Frame serialization should not fail")
}

/// Decodes a datagram's bytes into a frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.len() > MAX_DATAGRAM_SIZE {
        return Err(CodecError::TooLarge);
    }
    Ok(serde_json::from_slice(bytes)?)
}
