//! Protocol constants

/// Current control-protocol version carried in `Hello`.
pub const PROTO_VERSION: u8 = 1;
/// Oldest client protocol version the server still accepts.
pub const MIN_PROTO_VERSION: u8 = 1;

/// Stream 0 is the control stream on every session.
pub const CONTROL_STREAM_ID: u32 = 0;
/// First stream id the client allocates (odd ids).
pub const CLIENT_FIRST_STREAM_ID: u32 = 1;
/// First stream id the server allocates (even ids).
pub const SERVER_FIRST_STREAM_ID: u32 = 2;

/// Largest mux frame (type byte + payload).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
/// Largest data chunk carried in one `Data` frame.
pub const MAX_DATA_CHUNK: usize = 64 * 1024;
/// Largest control message payload on stream 0.
pub const MAX_CONTROL_FRAME: u32 = 1024 * 1024;

/// Per-stream flow-control window, each direction.
pub const INITIAL_STREAM_WINDOW: u32 = 256 * 1024;

/// Data-stream kind byte: HTTP ingress.
pub const STREAM_KIND_HTTP: u8 = 0x01;
/// Data-stream kind byte: raw TCP ingress.
pub const STREAM_KIND_TCP: u8 = 0x02;
/// Data-stream kind byte: UDP datagram bridge.
pub const STREAM_KIND_UDP: u8 = 0x03;
