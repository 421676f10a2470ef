//! Burrow client: session manager, stream pool and local forwarder.
//!
//! The [`SessionManager`] owns the client's sessions: it dials the server,
//! authenticates, registers the configured tunnels, keeps a pool of
//! pre-opened streams warm, and reconnects with backoff when the transport
//! drops — replaying every tunnel the caller asked for.

pub mod forwarder;
pub mod manager;
pub mod pool;
pub mod session;

pub use manager::{SessionManager, TokenRefresher, TunnelEvent, TunnelIntent};
