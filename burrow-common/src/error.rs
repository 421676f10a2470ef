//! Error types for Burrow

use thiserror::Error;

/// Main error type for tunnel operations.
///
/// Transport and protocol errors are session-fatal: the whole session is torn
/// down and the client reconnects. Authorization and per-request errors are
/// reported to the caller and leave the session open.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol violation (bad framing, unknown tag, credit violation)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Tunnel registration rejected
    #[error("Registration rejected: {0}")]
    Register(String),

    /// The session is closed; every pending stream and waiter gets this
    #[error("Session closed")]
    SessionClosed,

    /// Tunnel not found
    #[error("Tunnel {0} not found")]
    TunnelNotFound(u64),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TunnelError {
    /// True for errors that collapse the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Io(_)
                | TunnelError::Protocol(_)
                | TunnelError::SessionClosed
                | TunnelError::Connection(_)
                | TunnelError::Tls(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;
