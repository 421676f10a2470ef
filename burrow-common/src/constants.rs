//! Shared defaults for the tunnel data plane.

use std::time::Duration;

/// Control-plane listener port.
pub const DEFAULT_CONTROL_PORT: u16 = 4443;
/// Public HTTP ingress port.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
/// Public HTTPS ingress port.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Leasable TCP port range.
pub const DEFAULT_TCP_PORT_RANGE: (u16, u16) = (10_000, 20_000);
/// Leasable UDP port range.
pub const DEFAULT_UDP_PORT_RANGE: (u16, u16) = (20_001, 30_000);

/// Keepalive probe interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// A session with no pong for this long is dead.
pub const DEFAULT_DEAD_SESSION_AFTER: Duration = Duration::from_secs(90);
/// Deadline for a control request waiter.
pub const DEFAULT_CONTROL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Client-side local dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle deadline for an HTTP tunnel stream.
pub const DEFAULT_HTTP_STREAM_IDLE: Duration = Duration::from_secs(300);
/// Idle interval after which a UDP NAT entry expires.
pub const DEFAULT_UDP_NAT_IDLE: Duration = Duration::from_secs(60);

/// Pre-opened streams kept by the client pool.
pub const DEFAULT_STREAM_POOL_SIZE: usize = 256;
/// Secondary data sessions opened after the primary.
pub const DEFAULT_DATA_SESSIONS: usize = 0;
/// Upper bound on configured secondary data sessions.
pub const MAX_DATA_SESSIONS: usize = 4;
