//! Mux frame definitions
//!
//! These frames are what actually crosses the TCP/TLS connection. Control
//! messages never appear here directly: they are bytes inside `Data` frames
//! for stream 0.

use bytes::Bytes;

/// Flag bit on `Data`: sender half-closes its direction after this payload.
pub const FLAG_FIN: u8 = 0x01;

/// A multiplexer frame.
///
/// `Data` carries raw stream bytes and dominates traffic; everything else is
/// bookkeeping. Payload bytes are zero-copy slices of the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxFrame {
    /// Peer opened a new stream. Ids are odd for the client, even for the
    /// server; stream 0 is never opened explicitly.
    OpenStream { stream_id: u32 },

    /// Stream payload. `fin` half-closes the sender's direction.
    Data {
        stream_id: u32,
        data: Bytes,
        fin: bool,
    },

    /// Flow-control credit: the receiver consumed `delta` bytes.
    WindowUpdate { stream_id: u32, delta: u32 },

    /// Abrupt full close of a stream, both directions.
    ResetStream { stream_id: u32 },

    /// Liveness probe; `Pong` echoes the nonce.
    Ping { nonce: u64 },

    /// Probe reply.
    Pong { nonce: u64 },

    /// Session is going down; no further streams will be accepted.
    GoAway { code: u8 },
}

impl MuxFrame {
    /// Stream this frame belongs to, if any.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            MuxFrame::OpenStream { stream_id }
            | MuxFrame::Data { stream_id, .. }
            | MuxFrame::WindowUpdate { stream_id, .. }
            | MuxFrame::ResetStream { stream_id } => Some(*stream_id),
            _ => None,
        }
    }
}
