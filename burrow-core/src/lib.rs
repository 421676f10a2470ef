//! Burrow core: transport, stream multiplexer, control channel.
//!
//! Everything both endpoints share lives here. The server and client crates
//! compose these pieces into the ingress dispatchers and the session manager.

pub mod control;
pub mod mux;
pub mod reconnect;
pub mod transport;

pub use control::ControlChannel;
pub use mux::{MuxSession, Multiplexer, SessionRole, VirtualStream};
