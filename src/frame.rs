//! Provides the LSP wire frame type and the truncation-guard helper used by
//! the connection state machine.

use serde::{Deserialize, Serialize};

/// The three frame kinds carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Connect,
    Data,
    Ack,
}

/// One frame: the atomic unit of a single UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    pub conn_id: u32,
    pub seq_num: u32,
    pub size: u32,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Frame {
    /// A connect request: `conn_id = 0`, `seq_num = 0`, empty payload.
    pub fn connect() -> Self {
        Frame {
            kind: FrameKind::Connect,
            conn_id: 0,
            seq_num: 0,
            size: 0,
            payload: Vec::new(),
        }
    }

    /// A data frame carrying `payload` at `seq_num` on `conn_id`.
    pub fn data(conn_id: u32, seq_num: u32, payload: Vec<u8>) -> Self {
        let size = payload.len() as u32;
        Frame {
            kind: FrameKind::Data,
            conn_id,
            seq_num,
            size,
            payload,
        }
    }

    /// An acknowledgement for `seq_num` on `conn_id`. `seq_num = 0` is the
    /// reserved connect-accept / keepalive form.
    pub fn ack(conn_id: u32, seq_num: u32) -> Self {
        Frame {
            kind: FrameKind::Ack,
            conn_id,
            seq_num,
            size: 0,
            payload: Vec::new(),
        }
    }

    /// Applies the truncation guard: a frame whose declared `size` exceeds
    /// the actual payload length is malformed and must be discarded
    /// outright; a frame whose `size` is smaller than the payload is
    /// truncated to `size` before delivery. Returns `false` when the frame
    /// must be discarded.
    pub fn apply_truncation_guard(&mut self) -> bool {
        if self.size as usize > self.payload.len() {
            return false;
        }
        if (self.size as usize) < self.payload.len() {
            self.payload.truncate(self.size as usize);
        }
        true
    }
}
