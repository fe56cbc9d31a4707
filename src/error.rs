// ABOUTME: Error types returned by the public client/server API
// ABOUTME: Internal codec and demux errors never reach callers; they are logged and discarded

use thiserror::Error;

/// Errors surfaced to callers of [`crate::Client`] and [`crate::Server`].
#[derive(Debug, Error)]
pub enum LspError {
    /// The UDP socket could not be created or bound.
    #[error("socket setup failed: {0}")]
    Setup(#[from] std::io::Error),

    /// A client's connect request went unacknowledged for `epochs` consecutive
    /// epochs.
    #[error("no response to connect request after {epochs} epochs")]
    HandshakeTimeout { epochs: u32 },

    /// The connection has not received any frame for `epoch_limit` epochs and
    /// is considered lost.
    #[error("connection {conn_id} lost (no traffic within epoch limit)")]
    ConnectionLost { conn_id: u32 },

    /// The endpoint was closed while the call was pending.
    #[error("endpoint closed")]
    EndpointClosed,
}

/// Result type alias for LSP operations.
pub type Result<T> = std::result::Result<T, LspError>;
