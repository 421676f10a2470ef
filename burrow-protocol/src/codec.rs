//! Codecs for mux frames and control messages
//!
//! Both layers use length-delimited framing:
//! - [`MuxCodec`] frames the whole connection: 4-byte big-endian length,
//!   1-byte type, then fixed binary fields and the payload.
//! - [`ControlCodec`] frames stream 0: 4-byte big-endian length, then a
//!   `bincode`-encoded [`Message`]. A zero-length frame is valid and is
//!   skipped (keepalive padding).

use crate::constants::{MAX_CONTROL_FRAME, MAX_FRAME_SIZE};
use crate::frame::{MuxFrame, FLAG_FIN};
use crate::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

const TYPE_OPEN: u8 = 0x01;
const TYPE_DATA: u8 = 0x02;
const TYPE_WINDOW_UPDATE: u8 = 0x03;
const TYPE_RESET: u8 = 0x04;
const TYPE_PING: u8 = 0x05;
const TYPE_PONG: u8 = 0x06;
const TYPE_GO_AWAY: u8 = 0x07;

/// Mux frame codec.
///
/// Wire format:
/// ```text
/// ┌─────────────┬───────────┬──────────────┐
/// │ Length (u32)│ Type (u8) │ Fields...    │
/// │ 4 bytes BE  │ 1 byte    │ N bytes      │
/// └─────────────┴───────────┴──────────────┘
/// ```
///
/// Length covers Type + Fields (not the length field itself).
#[derive(Debug, Clone, Copy)]
pub struct MuxCodec {
    max_frame_size: usize,
}

impl Default for MuxCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

impl MuxCodec {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

fn protocol_err(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl Decoder for MuxCodec {
    type Item = MuxFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(protocol_err("mux frame length must be at least 1 byte"));
        }
        if length > self.max_frame_size {
            return Err(protocol_err(format!(
                "mux frame too large: {length} bytes (max: {})",
                self.max_frame_size
            )));
        }

        let total = 4 + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total).freeze();
        frame.advance(4);
        let frame_type = frame.get_u8();

        macro_rules! need {
            ($n:expr, $msg:literal) => {
                if frame.remaining() < $n {
                    return Err(protocol_err($msg));
                }
            };
        }

        let decoded = match frame_type {
            TYPE_DATA => {
                need!(5, "data frame truncated");
                let stream_id = frame.get_u32();
                let flags = frame.get_u8();
                let data = frame.split_to(frame.remaining());
                MuxFrame::Data {
                    stream_id,
                    data,
                    fin: (flags & FLAG_FIN) != 0,
                }
            }
            TYPE_OPEN => {
                need!(4, "open frame truncated");
                MuxFrame::OpenStream {
                    stream_id: frame.get_u32(),
                }
            }
            TYPE_WINDOW_UPDATE => {
                need!(8, "window-update frame truncated");
                MuxFrame::WindowUpdate {
                    stream_id: frame.get_u32(),
                    delta: frame.get_u32(),
                }
            }
            TYPE_RESET => {
                need!(4, "reset frame truncated");
                MuxFrame::ResetStream {
                    stream_id: frame.get_u32(),
                }
            }
            TYPE_PING => {
                need!(8, "ping frame truncated");
                MuxFrame::Ping {
                    nonce: frame.get_u64(),
                }
            }
            TYPE_PONG => {
                need!(8, "pong frame truncated");
                MuxFrame::Pong {
                    nonce: frame.get_u64(),
                }
            }
            TYPE_GO_AWAY => {
                need!(1, "go-away frame truncated");
                MuxFrame::GoAway {
                    code: frame.get_u8(),
                }
            }
            other => return Err(protocol_err(format!("unknown mux frame type: {other}"))),
        };

        Ok(Some(decoded))
    }
}

impl Encoder<MuxFrame> for MuxCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: MuxFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            MuxFrame::Data {
                stream_id,
                data,
                fin,
            } => {
                let payload_len = 1 + 4 + 1 + data.len();
                if payload_len > self.max_frame_size {
                    return Err(protocol_err(format!(
                        "mux frame too large: {payload_len} bytes (max: {})",
                        self.max_frame_size
                    )));
                }
                dst.reserve(4 + payload_len);
                dst.put_u32(payload_len as u32);
                dst.put_u8(TYPE_DATA);
                dst.put_u32(stream_id);
                dst.put_u8(if fin { FLAG_FIN } else { 0 });
                dst.extend_from_slice(&data);
            }
            MuxFrame::OpenStream { stream_id } => {
                dst.reserve(4 + 5);
                dst.put_u32(5);
                dst.put_u8(TYPE_OPEN);
                dst.put_u32(stream_id);
            }
            MuxFrame::WindowUpdate { stream_id, delta } => {
                dst.reserve(4 + 9);
                dst.put_u32(9);
                dst.put_u8(TYPE_WINDOW_UPDATE);
                dst.put_u32(stream_id);
                dst.put_u32(delta);
            }
            MuxFrame::ResetStream { stream_id } => {
                dst.reserve(4 + 5);
                dst.put_u32(5);
                dst.put_u8(TYPE_RESET);
                dst.put_u32(stream_id);
            }
            MuxFrame::Ping { nonce } => {
                dst.reserve(4 + 9);
                dst.put_u32(9);
                dst.put_u8(TYPE_PING);
                dst.put_u64(nonce);
            }
            MuxFrame::Pong { nonce } => {
                dst.reserve(4 + 9);
                dst.put_u32(9);
                dst.put_u8(TYPE_PONG);
                dst.put_u64(nonce);
            }
            MuxFrame::GoAway { code } => {
                dst.reserve(4 + 2);
                dst.put_u32(2);
                dst.put_u8(TYPE_GO_AWAY);
                dst.put_u8(code);
            }
        }
        Ok(())
    }
}

/// Control message codec for stream 0.
///
/// Wire format: 4-byte big-endian length + bincode payload. Zero-length
/// frames are valid and skipped. Frames over the limit are a protocol
/// violation that kills the session.
#[derive(Debug, Clone, Copy)]
pub struct ControlCodec {
    max_frame_size: usize,
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_CONTROL_FRAME as usize,
        }
    }
}

impl ControlCodec {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ControlCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if length > self.max_frame_size {
                return Err(protocol_err(format!(
                    "control frame too large: {length} bytes (max: {})",
                    self.max_frame_size
                )));
            }
            if length == 0 {
                // Empty frame: keepalive padding, consume and keep parsing.
                src.advance(4);
                continue;
            }

            let total = 4 + length;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let mut frame = src.split_to(total).freeze();
            frame.advance(4);

            let config = bincode_next::config::standard()
                .with_limit::<{ MAX_CONTROL_FRAME as usize }>();
            let (message, _) = bincode_next::serde::decode_from_slice(frame.as_ref(), config)
                .map_err(|e| protocol_err(format!("control decode error: {e}")))?;
            return Ok(Some(message));
        }
    }
}

impl Encoder<Message> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let config = bincode_next::config::standard();
        let serialized = bincode_next::serde::encode_to_vec(&message, config)
            .map_err(|e| protocol_err(format!("control encode error: {e}")))?;

        if serialized.len() > self.max_frame_size {
            return Err(protocol_err(format!(
                "control frame too large: {} bytes (max: {})",
                serialized.len(),
                self.max_frame_size
            )));
        }

        dst.reserve(4 + serialized.len());
        dst.put_u32(serialized.len() as u32);
        dst.extend_from_slice(&serialized);
        Ok(())
    }
}
