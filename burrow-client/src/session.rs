//! Session establishment
//!
//! Dial, hello, authenticate: the client walks the session state machine
//! (Connecting → HelloSent → Authenticating → Operating) and hands back an
//! operating session plus its control channel.

use burrow_common::config::ClientConfig;
use burrow_common::TunnelError;
use burrow_core::control::ControlChannel;
use burrow_core::mux::{KeepaliveConfig, MuxSession, SessionRole};
use burrow_core::transport::{self, TransportConfig};
use burrow_protocol::constants::PROTO_VERSION;
use burrow_protocol::message::{AuthFailReason, Message, Quotas};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// An operating, authenticated session.
pub struct ClientSession {
    pub session: MuxSession,
    pub channel: Arc<ControlChannel>,
    pub client_id: Uuid,
    pub quotas: Quotas,
}

/// Why establishment failed; auth rejections are separated so the manager
/// can run the token refresher on expiry.
#[derive(Debug)]
pub enum EstablishError {
    Auth(AuthFailReason),
    Other(TunnelError),
}

impl From<TunnelError> for EstablishError {
    fn from(e: TunnelError) -> Self {
        EstablishError::Other(e)
    }
}

impl std::fmt::Display for EstablishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EstablishError::Auth(reason) => write!(f, "authentication rejected: {reason:?}"),
            EstablishError::Other(e) => write!(f, "{e}"),
        }
    }
}

/// Dial the server and walk the handshake. `attach_to` joins a secondary
/// data session to an existing client identity.
pub async fn establish(
    config: &ClientConfig,
    transport_config: &TransportConfig,
    token: &str,
    attach_to: Option<Uuid>,
) -> std::result::Result<ClientSession, EstablishError> {
    debug!(server = %config.server_addr, "connecting");
    let io = tokio::time::timeout(
        config.dial_timeout,
        transport::connect(transport_config, &config.server_addr),
    )
    .await
    .map_err(|_| TunnelError::Timeout("server dial".to_string()))?
    .map_err(TunnelError::from)?;

    let session = MuxSession::spawn(io, SessionRole::Client, KeepaliveConfig::default());
    let control = session
        .take_control_stream()
        .ok_or_else(|| TunnelError::Protocol("control stream unavailable".to_string()))?;
    let (channel, mut inbox) = ControlChannel::new(
        control,
        config.control_request_timeout,
        session.closed_token(),
    );
    // The server only sends responses; drain anything else so the control
    // read loop never backs up.
    tokio::spawn(async move { while inbox.recv().await.is_some() {} });

    let failed = session.clone();
    let close_on_error = move |e: EstablishError| {
        failed.close();
        e
    };

    // Hello.
    let reply = channel
        .request(|id| Message::Hello {
            id,
            proto_version: PROTO_VERSION,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        })
        .await
        .map_err(|e| close_on_error(e.into()))?;
    match reply {
        Message::HelloAck { server_version, .. } => {
            debug!(%server_version, "hello acknowledged");
        }
        other => {
            return Err(close_on_error(
                TunnelError::Protocol(format!("expected HelloAck, got {other:?}")).into(),
            ));
        }
    }

    // Authenticate.
    let reply = channel
        .request(|id| Message::Authenticate {
            id,
            token: token.to_string(),
            attach_to,
        })
        .await
        .map_err(|e| close_on_error(e.into()))?;
    match reply {
        Message::AuthOk {
            client_id, quotas, ..
        } => {
            info!(%client_id, secondary = attach_to.is_some(), "session operating");
            Ok(ClientSession {
                session,
                channel,
                client_id,
                quotas,
            })
        }
        Message::AuthFail { reason, .. } => {
            Err(close_on_error(EstablishError::Auth(reason)))
        }
        other => Err(close_on_error(
            TunnelError::Protocol(format!("expected AuthOk, got {other:?}")).into(),
        )),
    }
}
