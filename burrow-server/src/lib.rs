//! Burrow server: tunnel registry, session acceptor and ingress dispatchers.
//!
//! One [`TunnelServer`] owns the control-plane listener, the shared HTTP(S)
//! ingress, and the registry of live tunnels, hostname reservations and port
//! leases. TCP and UDP tunnels get their own leased listeners, started at
//! registration and stopped at teardown.

pub mod auth;
pub mod clients;
pub mod http;
pub mod observer;
pub mod registry;
pub mod server;
pub mod session;
pub mod tcp;
pub mod tls;
pub mod udp;

pub use auth::{
    DomainBinding, DomainResolver, Grant, StaticDomainResolver, StaticTokenValidator,
    TokenValidator,
};
pub use observer::{ExchangeLog, ExchangeRecord, TrafficObserver};
pub use registry::{TunnelRecord, TunnelRegistry};
pub use server::TunnelServer;
