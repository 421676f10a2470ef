//! Wire protocol for the Burrow reverse tunnel.
//!
//! Three layers live here:
//!
//! 1. **Mux frames** ([`frame`], [`codec::MuxCodec`]) — the length-delimited
//!    binary frames that carry every multiplexed stream over one TCP/TLS
//!    connection.
//! 2. **Control messages** ([`message`], [`codec::ControlCodec`]) — the
//!    request/response protocol spoken on stream 0 of every session.
//! 3. **Data-stream headers** ([`header`]) — the tiny inline prefix on each
//!    data stream that tells the client which tunnel a stream serves, plus
//!    the datagram framing used by UDP tunnels.

pub mod codec;
pub mod constants;
pub mod frame;
pub mod header;
pub mod message;
pub mod validation;
