//! Configuration for the server and client runtimes.
//!
//! These are plain structs: parsing them out of files or flags is the
//! caller's business (the CLI maps clap args onto them).

use crate::constants::{
    DEFAULT_CONTROL_PORT, DEFAULT_CONTROL_REQUEST_TIMEOUT, DEFAULT_DATA_SESSIONS,
    DEFAULT_DEAD_SESSION_AFTER, DEFAULT_DIAL_TIMEOUT, DEFAULT_HTTP_PORT, DEFAULT_HTTP_STREAM_IDLE,
    DEFAULT_PING_INTERVAL, DEFAULT_STREAM_POOL_SIZE, DEFAULT_TCP_PORT_RANGE,
    DEFAULT_UDP_NAT_IDLE, DEFAULT_UDP_PORT_RANGE,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

/// TLS settings for a listener or a dialer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// Enable TLS
    pub enabled: bool,
    /// Path to certificate file (PEM)
    pub cert_path: Option<PathBuf>,
    /// Path to private key file (PEM)
    pub key_path: Option<PathBuf>,
    /// Path to CA certificate used to verify the peer
    pub ca_cert_path: Option<PathBuf>,
    /// Server name for SNI (client side)
    pub server_name: Option<String>,
    /// Skip peer verification (client side, self-signed setups only)
    pub skip_verify: bool,
}

/// Server process configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Control-plane bind address (tunnel sessions)
    pub control_addr: SocketAddr,
    /// Public HTTP ingress bind address
    pub http_addr: SocketAddr,
    /// Public HTTPS ingress bind address; None disables HTTPS
    pub https_addr: Option<SocketAddr>,
    /// IP the leased TCP/UDP listeners bind to
    pub ingress_ip: IpAddr,
    /// Leasable TCP port range
    pub tcp_port_range: RangeInclusive<u16>,
    /// Leasable UDP port range
    pub udp_port_range: RangeInclusive<u16>,
    /// Base domain that subdomains hang under
    pub base_domain: String,
    /// Additional base domains subdomains may be claimed under
    pub aliases: Vec<String>,
    /// TLS for the control listener
    pub tls: TlsConfig,
    /// Keepalive probe interval
    pub ping_interval: Duration,
    /// Sessions silent for this long are dead
    pub dead_session_after: Duration,
    /// Idle deadline for an HTTP tunnel stream
    pub http_stream_idle: Duration,
    /// Idle interval after which a UDP NAT entry expires
    pub udp_nat_idle: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self {
            control_addr: SocketAddr::new(any, DEFAULT_CONTROL_PORT),
            http_addr: SocketAddr::new(any, DEFAULT_HTTP_PORT),
            https_addr: None,
            ingress_ip: any,
            tcp_port_range: DEFAULT_TCP_PORT_RANGE.0..=DEFAULT_TCP_PORT_RANGE.1,
            udp_port_range: DEFAULT_UDP_PORT_RANGE.0..=DEFAULT_UDP_PORT_RANGE.1,
            base_domain: "localhost".to_string(),
            aliases: Vec::new(),
            tls: TlsConfig::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
            dead_session_after: DEFAULT_DEAD_SESSION_AFTER,
            http_stream_idle: DEFAULT_HTTP_STREAM_IDLE,
            udp_nat_idle: DEFAULT_UDP_NAT_IDLE,
        }
    }
}

/// Client process configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server control-plane address ("host:port")
    pub server_addr: String,
    /// Auth token presented at session start
    pub token: String,
    /// TLS for the control connection
    pub tls: TlsConfig,
    /// Pre-opened streams kept ready for ingress pickup
    pub stream_pool_size: usize,
    /// Secondary data sessions (0-4); raises stream-open parallelism
    pub data_sessions: usize,
    /// Local dial timeout
    pub dial_timeout: Duration,
    /// Deadline for a control request waiter
    pub control_request_timeout: Duration,
    /// Reconnect backoff floor
    pub backoff_base: Duration,
    /// Reconnect backoff ceiling
    pub backoff_max: Duration,
    /// Give up after this many consecutive failed reconnects; None = never
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{DEFAULT_CONTROL_PORT}"),
            token: String::new(),
            tls: TlsConfig::default(),
            stream_pool_size: DEFAULT_STREAM_POOL_SIZE,
            data_sessions: DEFAULT_DATA_SESSIONS,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            control_request_timeout: DEFAULT_CONTROL_REQUEST_TIMEOUT,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_reconnect_attempts: None,
        }
    }
}
