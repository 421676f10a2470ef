//! Inline data-stream headers and UDP datagram framing
//!
//! The first bytes of every data stream identify which tunnel the stream
//! serves. The server writes the header when it dedicates a stream to an
//! ingress connection; the client parses it before dialing the local target.
//!
//! TCP/HTTP ingress:
//! ```text
//! [kind: u8] [tunnel_id: u64 BE] [addr_len: u16 BE] [addr UTF-8 "host:port"]
//! ```
//! followed by raw payload bytes.
//!
//! UDP ingress:
//! ```text
//! [kind: u8] [tunnel_id: u64 BE]
//! ```
//! followed by datagram frames, each:
//! ```text
//! [payload_len: u16 BE] [src_len: u16 BE] [src UTF-8 "host:port"] [payload]
//! ```
//! Ingress frames tag the public sender; reply frames echo the same tag so
//! the dispatcher knows which source to deliver to.

use crate::constants::{STREAM_KIND_HTTP, STREAM_KIND_TCP, STREAM_KIND_UDP};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest accepted "host:port" string in headers and datagram tags.
const MAX_ADDR_LEN: usize = 256;

/// Parsed data-stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamHeader {
    /// HTTP or raw TCP ingress; payload bytes follow directly.
    Stream {
        kind: StreamKind,
        tunnel_id: u64,
        remote_addr: String,
    },
    /// UDP bridge; datagram frames follow.
    Datagrams { tunnel_id: u64 },
}

/// Byte-stream kinds carried in the header's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Http,
    Tcp,
}

impl StreamKind {
    fn to_byte(self) -> u8 {
        match self {
            StreamKind::Http => STREAM_KIND_HTTP,
            StreamKind::Tcp => STREAM_KIND_TCP,
        }
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Write a TCP/HTTP stream header.
pub async fn write_stream_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    kind: StreamKind,
    tunnel_id: u64,
    remote_addr: &str,
) -> io::Result<()> {
    if remote_addr.len() > MAX_ADDR_LEN {
        return Err(invalid("remote address too long"));
    }
    let mut buf = Vec::with_capacity(1 + 8 + 2 + remote_addr.len());
    buf.push(kind.to_byte());
    buf.extend_from_slice(&tunnel_id.to_be_bytes());
    buf.extend_from_slice(&(remote_addr.len() as u16).to_be_bytes());
    buf.extend_from_slice(remote_addr.as_bytes());
    w.write_all(&buf).await
}

/// Write a UDP bridge header.
pub async fn write_datagram_header<W: AsyncWrite + Unpin>(
    w: &mut W,
    tunnel_id: u64,
) -> io::Result<()> {
    let mut buf = [0u8; 9];
    buf[0] = STREAM_KIND_UDP;
    buf[1..9].copy_from_slice(&tunnel_id.to_be_bytes());
    w.write_all(&buf).await
}

/// Read and parse the header off a freshly dedicated stream.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<StreamHeader> {
    let kind = r.read_u8().await?;
    let tunnel_id = r.read_u64().await?;

    match kind {
        STREAM_KIND_HTTP | STREAM_KIND_TCP => {
            let addr_len = r.read_u16().await? as usize;
            if addr_len > MAX_ADDR_LEN {
                return Err(invalid("remote address too long"));
            }
            let mut addr = vec![0u8; addr_len];
            r.read_exact(&mut addr).await?;
            let remote_addr = String::from_utf8(addr)
                .map_err(|_| invalid("remote address is not UTF-8"))?;
            let kind = if kind == STREAM_KIND_HTTP {
                StreamKind::Http
            } else {
                StreamKind::Tcp
            };
            Ok(StreamHeader::Stream {
                kind,
                tunnel_id,
                remote_addr,
            })
        }
        STREAM_KIND_UDP => Ok(StreamHeader::Datagrams { tunnel_id }),
        other => Err(invalid(&format!("unknown stream kind: {other:#04x}"))),
    }
}

/// One datagram crossing a UDP bridge stream, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Public sender ("host:port") on ingress; echoed back on replies.
    pub src_addr: String,
    pub payload: Vec<u8>,
}

/// Write one datagram frame.
pub async fn write_datagram<W: AsyncWrite + Unpin>(
    w: &mut W,
    src_addr: &str,
    payload: &[u8],
) -> io::Result<()> {
    if src_addr.len() > MAX_ADDR_LEN {
        return Err(invalid("source address too long"));
    }
    if payload.len() > u16::MAX as usize {
        return Err(invalid("datagram payload too large"));
    }
    let mut buf = Vec::with_capacity(4 + src_addr.len() + payload.len());
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(&(src_addr.len() as u16).to_be_bytes());
    buf.extend_from_slice(src_addr.as_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await
}

/// Read one datagram frame. Returns `None` on clean EOF at a frame boundary.
pub async fn read_datagram<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Datagram>> {
    let payload_len = match r.read_u16().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let src_len = r.read_u16().await? as usize;
    if src_len > MAX_ADDR_LEN {
        return Err(invalid("source address too long"));
    }

    let mut src = vec![0u8; src_len];
    r.read_exact(&mut src).await?;
    let src_addr =
        String::from_utf8(src).map_err(|_| invalid("source address is not UTF-8"))?;

    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).await?;

    Ok(Some(Datagram { src_addr, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_header_round_trip() {
        let mut buf = Vec::new();
        write_stream_header(&mut buf, StreamKind::Tcp, 42, "203.0.113.9:55123")
            .await
            .unwrap();

        let mut cursor = io::Cursor::new(buf);
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(
            header,
            StreamHeader::Stream {
                kind: StreamKind::Tcp,
                tunnel_id: 42,
                remote_addr: "203.0.113.9:55123".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_datagram_header_round_trip() {
        let mut buf = Vec::new();
        write_datagram_header(&mut buf, 7).await.unwrap();

        let mut cursor = io::Cursor::new(buf);
        let header = read_header(&mut cursor).await.unwrap();
        assert_eq!(header, StreamHeader::Datagrams { tunnel_id: 7 });
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let mut buf = Vec::new();
        write_datagram(&mut buf, "198.51.100.7:9000", b"a").await.unwrap();
        write_datagram(&mut buf, "198.51.100.8:9001", b"b").await.unwrap();

        let mut cursor = io::Cursor::new(buf);
        let d1 = read_datagram(&mut cursor).await.unwrap().unwrap();
        let d2 = read_datagram(&mut cursor).await.unwrap().unwrap();
        assert_eq!(d1.src_addr, "198.51.100.7:9000");
        assert_eq!(d1.payload, b"a");
        assert_eq!(d2.src_addr, "198.51.100.8:9001");
        assert_eq!(d2.payload, b"b");

        // Clean EOF at a frame boundary.
        assert!(read_datagram(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_kind_rejected() {
        let mut cursor = io::Cursor::new(vec![0x7Fu8, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(read_header(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_datagram_allowed() {
        let mut buf = Vec::new();
        write_datagram(&mut buf, "10.0.0.1:1234", b"").await.unwrap();
        let mut cursor = io::Cursor::new(buf);
        let d = read_datagram(&mut cursor).await.unwrap().unwrap();
        assert!(d.payload.is_empty());
    }
}
