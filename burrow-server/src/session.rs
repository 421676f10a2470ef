//! Control-plane session handling
//!
//! One task per connected client session: handshake (hello, authenticate),
//! then the operating loop serving registration, teardown, token refresh
//! and ping until the session dies. Primary-session death tears down the
//! client's tunnels, reservations and leases; secondary-session death only
//! shrinks the stream-open pick list.

use crate::clients::ClientHandle;
use crate::registry::{HttpDescriptor, TunnelRecord};
use crate::server::ServerContext;
use crate::{tcp, udp};
use burrow_common::constants::DEFAULT_CONTROL_REQUEST_TIMEOUT;
use burrow_common::{Result, TunnelError};
use burrow_core::mux::{KeepaliveConfig, MuxSession, SessionRole};
use burrow_core::transport::BoxedStream;
use burrow_core::ControlChannel;
use burrow_protocol::constants::{MIN_PROTO_VERSION, PROTO_VERSION};
use burrow_protocol::message::{
    AuthFailReason, Message, RegisterFailReason, TunnelKind, TunnelSpec,
};
use burrow_protocol::validation::{is_valid_hostname, is_valid_subdomain, subdomain_permitted};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline for the hello/authenticate exchange on a fresh session.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Ports tried per auto-allocating registration before giving up; claimed
/// ports that fail to bind are excluded and retried against the next one.
const MAX_BIND_ATTEMPTS: usize = 32;

pub(crate) async fn handle_control_connection(
    ctx: Arc<ServerContext>,
    io: BoxedStream,
    addr: SocketAddr,
) -> Result<()> {
    let keepalive = KeepaliveConfig {
        interval: ctx.config.ping_interval,
        dead_after: ctx.config.dead_session_after,
    };
    let session = MuxSession::spawn(io, SessionRole::Server, keepalive);
    let Some(control) = session.take_control_stream() else {
        return Err(TunnelError::Protocol("control stream unavailable".into()));
    };
    let (channel, mut inbox) =
        ControlChannel::new(control, DEFAULT_CONTROL_REQUEST_TIMEOUT, session.closed_token());

    let outcome = run_session(&ctx, &session, &channel, &mut inbox, addr).await;
    session.close();
    outcome
}

async fn next_message(inbox: &mut mpsc::Receiver<Message>) -> Result<Message> {
    match tokio::time::timeout(HANDSHAKE_TIMEOUT, inbox.recv()).await {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => Err(TunnelError::SessionClosed),
        Err(_) => Err(TunnelError::Timeout("handshake".to_string())),
    }
}

async fn run_session(
    ctx: &Arc<ServerContext>,
    session: &MuxSession,
    channel: &Arc<ControlChannel>,
    inbox: &mut mpsc::Receiver<Message>,
    addr: SocketAddr,
) -> Result<()> {
    // 1. Hello.
    let (hello_id, proto_version) = match next_message(inbox).await? {
        Message::Hello {
            id, proto_version, ..
        } => (id, proto_version),
        other => {
            return Err(TunnelError::Protocol(format!(
                "expected Hello, got {other:?}"
            )));
        }
    };
    channel
        .send(Message::HelloAck {
            id: hello_id,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            min_client_version: "0.9.0".to_string(),
        })
        .await?;
    if proto_version < MIN_PROTO_VERSION || proto_version > PROTO_VERSION {
        warn!(%addr, proto_version, "unsupported protocol version");
        return Err(TunnelError::Protocol("unsupported protocol version".into()));
    }

    // 2. Authenticate.
    let (auth_id, token, attach_to) = match next_message(inbox).await? {
        Message::Authenticate {
            id,
            token,
            attach_to,
        } => (id, token, attach_to),
        other => {
            return Err(TunnelError::Protocol(format!(
                "expected Authenticate, got {other:?}"
            )));
        }
    };

    let (handle, is_primary) = match attach_to {
        Some(client_id) => {
            // Secondary data session joining an existing identity.
            let Some(handle) = ctx.clients.get(&client_id) else {
                channel
                    .send(Message::AuthFail {
                        id: auth_id,
                        reason: AuthFailReason::UnknownClient,
                    })
                    .await?;
                return Err(TunnelError::Authentication("unknown client".into()));
            };
            if !handle.token_matches(&token) {
                channel
                    .send(Message::AuthFail {
                        id: auth_id,
                        reason: AuthFailReason::InvalidToken,
                    })
                    .await?;
                return Err(TunnelError::Authentication("token mismatch".into()));
            }
            handle.add_session(session.multiplexer());
            (handle, false)
        }
        None => match ctx.validator.validate(&token) {
            Ok(grant) => {
                let client_id = Uuid::new_v4();
                let handle = ClientHandle::new(
                    client_id,
                    grant.user_id,
                    grant.quotas,
                    grant.allowed_subdomains,
                    token,
                    session.multiplexer(),
                );
                ctx.clients.insert(Arc::clone(&handle));
                (handle, true)
            }
            Err(e) => {
                let reason = match e {
                    crate::auth::AuthError::TokenExpired => AuthFailReason::TokenExpired,
                    crate::auth::AuthError::InvalidToken => AuthFailReason::InvalidToken,
                };
                channel
                    .send(Message::AuthFail {
                        id: auth_id,
                        reason,
                    })
                    .await?;
                return Err(TunnelError::Authentication("invalid token".into()));
            }
        },
    };

    channel
        .send(Message::AuthOk {
            id: auth_id,
            client_id: handle.client_id,
            quotas: handle.quotas.clone(),
        })
        .await?;
    info!(
        %addr,
        client_id = %handle.client_id,
        user = %handle.user_id,
        primary = is_primary,
        "session authenticated"
    );

    // 3. Pickup: streams the client pre-opens land in the handle's queue.
    {
        let session = session.clone();
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            while let Ok(stream) = session.accept_stream().await {
                handle.offer_pooled(stream);
            }
        });
    }

    // 4. Operate.
    let closed = session.closed_token();
    let outcome = loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break Ok(()),
            maybe = inbox.recv() => match maybe {
                Some(msg) => msg,
                None => break Ok(()),
            },
        };

        match message {
            Message::RegisterTunnel {
                id,
                spec,
                local_hint,
            } => match register_tunnel(ctx, &handle, &spec, &local_hint).await {
                Ok((record, pending)) => {
                    // Reply before the dispatcher may open any data stream
                    // referencing the new tunnel.
                    let reply = Message::TunnelRegistered {
                        id,
                        tunnel_id: record.id,
                        endpoint: record.endpoint.clone(),
                    };
                    if let Err(e) = channel.send(reply).await {
                        break Err(e);
                    }
                    pending.start(ctx, &handle);
                    info!(
                        client_id = %handle.client_id,
                        tunnel_id = record.id,
                        endpoint = %record.endpoint,
                        local = %local_hint,
                        "tunnel registered"
                    );
                }
                Err(reason) => {
                    debug!(client_id = %handle.client_id, %reason, "registration rejected");
                    if let Err(e) = channel.send(Message::RegisterFail { id, reason }).await {
                        break Err(e);
                    }
                }
            },
            Message::CloseTunnel { id, tunnel_id } => {
                close_tunnel(ctx, &handle, tunnel_id);
                if let Err(e) = channel.send(Message::Ack { id }).await {
                    break Err(e);
                }
            }
            Message::TokenRefresh { id, token } => {
                handle.set_token(token);
                if let Err(e) = channel.send(Message::Ack { id }).await {
                    break Err(e);
                }
            }
            Message::Ping { id } => {
                if let Err(e) = channel.send(Message::Pong { id }).await {
                    break Err(e);
                }
            }
            other => {
                debug!(client_id = %handle.client_id, "ignoring message: {other:?}");
            }
        }
    };

    // 5. Teardown. Destruction starts at the session, never at a tunnel.
    if is_primary {
        ctx.clients.remove(&handle.client_id);
        let removed = ctx.registry.remove_client(handle.client_id);
        for record in &removed {
            record.stop.cancel();
        }
        handle.close_all_sessions();
        info!(
            client_id = %handle.client_id,
            tunnels = removed.len(),
            "client disconnected, tunnels released"
        );
    } else {
        handle.prune_dead_sessions();
        debug!(client_id = %handle.client_id, "data session closed");
    }

    outcome
}

/// A dispatcher ready to start once the registration reply is on the wire.
pub(crate) enum PendingDispatcher {
    /// HTTP needs none: the shared listener routes by reservation.
    None,
    Tcp {
        listener: TcpListener,
        record: Arc<TunnelRecord>,
    },
    Udp {
        socket: Arc<UdpSocket>,
        record: Arc<TunnelRecord>,
    },
}

impl PendingDispatcher {
    fn start(self, ctx: &Arc<ServerContext>, handle: &Arc<ClientHandle>) {
        match self {
            PendingDispatcher::None => {}
            PendingDispatcher::Tcp { listener, record } => {
                tokio::spawn(tcp::run_tcp_tunnel(listener, record, Arc::clone(handle)));
            }
            PendingDispatcher::Udp { socket, record } => {
                tokio::spawn(udp::run_udp_tunnel(
                    socket,
                    record,
                    Arc::clone(handle),
                    ctx.config.udp_nat_idle,
                ));
            }
        }
    }
}

async fn register_tunnel(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ClientHandle>,
    spec: &TunnelSpec,
    local_hint: &str,
) -> std::result::Result<(Arc<TunnelRecord>, PendingDispatcher), RegisterFailReason> {
    match spec {
        TunnelSpec::Http { host } => {
            let descriptor = resolve_http_descriptor(ctx, handle, host)?;
            let record = ctx.registry.register_http(
                handle.client_id,
                &handle.user_id,
                &handle.quotas,
                &descriptor,
                local_hint,
            )?;
            Ok((record, PendingDispatcher::None))
        }
        TunnelSpec::Tcp { port } => {
            let mut exclude = HashSet::new();
            loop {
                let candidate = ctx.registry.claim_port(
                    handle.client_id,
                    &handle.quotas,
                    TunnelKind::Tcp,
                    *port,
                    &exclude,
                )?;
                match TcpListener::bind((ctx.config.ingress_ip, candidate)).await {
                    Ok(listener) => {
                        let record = ctx.registry.commit_port_tunnel(
                            handle.client_id,
                            &handle.user_id,
                            TunnelKind::Tcp,
                            candidate,
                            local_hint,
                        );
                        return Ok((
                            Arc::clone(&record),
                            PendingDispatcher::Tcp { listener, record },
                        ));
                    }
                    Err(e) => {
                        debug!(port = candidate, error = %e, "tcp lease bind failed");
                        ctx.registry.release_port(TunnelKind::Tcp, candidate);
                        if *port != 0 {
                            return Err(RegisterFailReason::PortTaken);
                        }
                        exclude.insert(candidate);
                        if exclude.len() >= MAX_BIND_ATTEMPTS {
                            return Err(RegisterFailReason::NoPorts);
                        }
                    }
                }
            }
        }
        TunnelSpec::Udp { port } => {
            let mut exclude = HashSet::new();
            loop {
                let candidate = ctx.registry.claim_port(
                    handle.client_id,
                    &handle.quotas,
                    TunnelKind::Udp,
                    *port,
                    &exclude,
                )?;
                match UdpSocket::bind((ctx.config.ingress_ip, candidate)).await {
                    Ok(socket) => {
                        let record = ctx.registry.commit_port_tunnel(
                            handle.client_id,
                            &handle.user_id,
                            TunnelKind::Udp,
                            candidate,
                            local_hint,
                        );
                        return Ok((
                            Arc::clone(&record),
                            PendingDispatcher::Udp {
                                socket: Arc::new(socket),
                                record,
                            },
                        ));
                    }
                    Err(e) => {
                        debug!(port = candidate, error = %e, "udp lease bind failed");
                        ctx.registry.release_port(TunnelKind::Udp, candidate);
                        if *port != 0 {
                            return Err(RegisterFailReason::PortTaken);
                        }
                        exclude.insert(candidate);
                        if exclude.len() >= MAX_BIND_ATTEMPTS {
                            return Err(RegisterFailReason::NoPorts);
                        }
                    }
                }
            }
        }
    }
}

/// Map the requested host onto a concrete descriptor.
///
/// Empty means "assign a random subdomain"; a bare label claims a subdomain
/// under the base domain; `label.alias` claims under an alias; anything
/// else must be a verified custom domain owned by this user.
fn resolve_http_descriptor(
    ctx: &Arc<ServerContext>,
    handle: &Arc<ClientHandle>,
    host: &str,
) -> std::result::Result<HttpDescriptor, RegisterFailReason> {
    let host = host.trim().to_ascii_lowercase();
    if host.is_empty() {
        return Ok(HttpDescriptor::Random);
    }

    let claim_subdomain = |label: &str, base: &str| {
        if !is_valid_subdomain(label) {
            return Err(RegisterFailReason::InvalidSubdomain);
        }
        if !subdomain_permitted(&handle.allowed_subdomains, label) {
            return Err(RegisterFailReason::SubdomainNotPermitted);
        }
        Ok(HttpDescriptor::Subdomain {
            label: label.to_string(),
            base: base.to_string(),
        })
    };

    if !host.contains('.') {
        return claim_subdomain(&host, &ctx.config.base_domain);
    }

    for base in std::iter::once(&ctx.config.base_domain).chain(ctx.config.aliases.iter()) {
        if let Some(label) = host.strip_suffix(&format!(".{base}")) {
            if !label.contains('.') {
                return claim_subdomain(label, base);
            }
        }
    }

    if !is_valid_hostname(&host) {
        return Err(RegisterFailReason::InvalidSubdomain);
    }
    match ctx.resolver.resolve(&host) {
        Some(binding) if binding.owner_user_id == handle.user_id => {
            Ok(HttpDescriptor::Custom { fqdn: host })
        }
        _ => Err(RegisterFailReason::DomainNotVerified),
    }
}

/// `CloseTunnel` semantics: authoritative and idempotent; closing a tunnel
/// you do not own (or that is already gone) is benign.
fn close_tunnel(ctx: &Arc<ServerContext>, handle: &Arc<ClientHandle>, tunnel_id: u64) {
    let owned = ctx
        .registry
        .lookup(tunnel_id)
        .is_some_and(|r| r.client_id == handle.client_id);
    if !owned {
        debug!(tunnel_id, "close for unknown or foreign tunnel ignored");
        return;
    }
    if let Some(record) = ctx.registry.remove_tunnel(tunnel_id) {
        record.stop.cancel();
        info!(
            client_id = %handle.client_id,
            tunnel_id,
            endpoint = %record.endpoint,
            "tunnel closed"
        );
    }
}
