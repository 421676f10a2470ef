//! Control protocol messages
//!
//! Spoken on stream 0 of every session, framed by [`crate::codec::ControlCodec`].
//! Requests carry a correlation `id`; the matching response echoes it.
//! Messages without an `id` accessor are notifications.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a registration asks for.
///
/// An empty `host` asks the server to assign a random subdomain; a name
/// without dots claims a subdomain under the server's base domain (or an
/// alias); a dotted name claims a verified custom domain. Port 0 asks the
/// server to allocate from the configured range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TunnelSpec {
    Http { host: String },
    Tcp { port: u16 },
    Udp { port: u16 },
}

impl TunnelSpec {
    pub fn kind(&self) -> TunnelKind {
        match self {
            TunnelSpec::Http { .. } => TunnelKind::Http,
            TunnelSpec::Tcp { .. } => TunnelKind::Tcp,
            TunnelSpec::Udp { .. } => TunnelKind::Udp,
        }
    }
}

/// Closed set of tunnel kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TunnelKind {
    Http,
    Tcp,
    Udp,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Http => write!(f, "http"),
            TunnelKind::Tcp => write!(f, "tcp"),
            TunnelKind::Udp => write!(f, "udp"),
        }
    }
}

/// The public binding a registration was resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    Http { fqdn: String },
    Tcp { port: u16 },
    Udp { port: u16 },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Http { fqdn } => write!(f, "https://{fqdn}"),
            Endpoint::Tcp { port } => write!(f, "tcp/{port}"),
            Endpoint::Udp { port } => write!(f, "udp/{port}"),
        }
    }
}

/// Limits granted by the token validator, echoed to the client at auth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotas {
    /// Active tunnels per client
    pub max_tunnels: u32,
    /// Active hostname reservations per user
    pub max_domains: u32,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            max_tunnels: 16,
            max_domains: 8,
        }
    }
}

/// Why authentication was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthFailReason {
    InvalidToken,
    TokenExpired,
    UnsupportedVersion,
    UnknownClient,
}

/// Why a registration was rejected. Never session-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterFailReason {
    SubdomainTaken,
    SubdomainNotPermitted,
    InvalidSubdomain,
    DomainNotVerified,
    PortTaken,
    PortOutOfRange,
    NoPorts,
    QuotaExceeded,
}

impl std::fmt::Display for RegisterFailReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegisterFailReason::SubdomainTaken => "subdomain_taken",
            RegisterFailReason::SubdomainNotPermitted => "subdomain_not_permitted",
            RegisterFailReason::InvalidSubdomain => "invalid_subdomain",
            RegisterFailReason::DomainNotVerified => "domain_not_verified",
            RegisterFailReason::PortTaken => "port_taken",
            RegisterFailReason::PortOutOfRange => "port_out_of_range",
            RegisterFailReason::NoPorts => "no_ports",
            RegisterFailReason::QuotaExceeded => "quota_exceeded",
        };
        write!(f, "{s}")
    }
}

/// A control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// First message on a fresh session, client to server.
    Hello {
        id: u64,
        proto_version: u8,
        client_version: String,
    },
    HelloAck {
        id: u64,
        server_version: String,
        min_client_version: String,
    },

    /// `attach_to` joins a secondary data session to an existing client
    /// identity; the token must match.
    Authenticate {
        id: u64,
        token: String,
        attach_to: Option<Uuid>,
    },
    AuthOk {
        id: u64,
        client_id: Uuid,
        quotas: Quotas,
    },
    AuthFail {
        id: u64,
        reason: AuthFailReason,
    },

    RegisterTunnel {
        id: u64,
        spec: TunnelSpec,
        /// Client-local target, e.g. "127.0.0.1:3000"; informational to the
        /// server (shown in logs), authoritative on the client.
        local_hint: String,
    },
    TunnelRegistered {
        id: u64,
        tunnel_id: u64,
        endpoint: Endpoint,
    },
    RegisterFail {
        id: u64,
        reason: RegisterFailReason,
    },

    CloseTunnel {
        id: u64,
        tunnel_id: u64,
    },

    /// Generic success reply (CloseTunnel, TokenRefresh).
    Ack {
        id: u64,
    },

    /// Client installed a fresh token; the server uses it for later checks.
    TokenRefresh {
        id: u64,
        token: String,
    },

    Ping {
        id: u64,
    },
    Pong {
        id: u64,
    },
}

impl Message {
    /// Correlation id, present on every request and response.
    pub fn id(&self) -> u64 {
        match self {
            Message::Hello { id, .. }
            | Message::HelloAck { id, .. }
            | Message::Authenticate { id, .. }
            | Message::AuthOk { id, .. }
            | Message::AuthFail { id, .. }
            | Message::RegisterTunnel { id, .. }
            | Message::TunnelRegistered { id, .. }
            | Message::RegisterFail { id, .. }
            | Message::CloseTunnel { id, .. }
            | Message::Ack { id }
            | Message::TokenRefresh { id, .. }
            | Message::Ping { id }
            | Message::Pong { id } => *id,
        }
    }

    /// True for messages that answer a request (routed to a waiter).
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::HelloAck { .. }
                | Message::AuthOk { .. }
                | Message::AuthFail { .. }
                | Message::TunnelRegistered { .. }
                | Message::RegisterFail { .. }
                | Message::Ack { .. }
                | Message::Pong { .. }
        )
    }
}
