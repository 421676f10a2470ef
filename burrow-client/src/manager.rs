//! Session manager
//!
//! Owns the client's sessions end to end: dial and authenticate, register
//! every tunnel the caller asked for, keep the stream pool warm, open
//! secondary data sessions, and reconnect with bounded exponential backoff
//! when the transport drops — replaying the stored tunnel intents, not the
//! server-side ids that died with the old session.

use crate::forwarder::LocalForwarder;
use crate::pool::run_pool;
use crate::session::{establish, ClientSession, EstablishError};
use burrow_common::config::ClientConfig;
use burrow_common::constants::{DEFAULT_UDP_NAT_IDLE, MAX_DATA_SESSIONS};
use burrow_common::{Result, TunnelError};
use burrow_core::mux::MuxSession;
use burrow_core::reconnect::{Backoff, BackoffConfig};
use burrow_core::transport::TransportConfig;
use burrow_core::ControlChannel;
use burrow_protocol::message::{
    AuthFailReason, Endpoint, Message, RegisterFailReason, TunnelSpec,
};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supplies a fresh token when the server reports the current one expired.
pub trait TokenRefresher: Send + Sync {
    fn refresh(&self, old_token: &str) -> Result<String>;
}

/// A tunnel the caller wants, by user intent. The manager re-issues these
/// on every reconnect; after a TCP/UDP assignment the port hint is pinned
/// to the assigned port so replay asks for the same one.
#[derive(Debug, Clone)]
pub struct TunnelIntent {
    pub spec: TunnelSpec,
    pub local_addr: String,
    pinned: bool,
    /// Tunnel id from the latest registration; stale across reconnects.
    last_tunnel_id: Option<u64>,
}

impl TunnelIntent {
    pub fn new(spec: TunnelSpec, local_addr: impl Into<String>) -> Self {
        Self {
            spec,
            local_addr: local_addr.into(),
            pinned: false,
            last_tunnel_id: None,
        }
    }

    pub fn http(host: impl Into<String>, local_addr: impl Into<String>) -> Self {
        Self::new(TunnelSpec::Http { host: host.into() }, local_addr)
    }

    pub fn tcp(port: u16, local_addr: impl Into<String>) -> Self {
        Self::new(TunnelSpec::Tcp { port }, local_addr)
    }

    pub fn udp(port: u16, local_addr: impl Into<String>) -> Self {
        Self::new(TunnelSpec::Udp { port }, local_addr)
    }
}

/// Lifecycle notifications emitted upward.
#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Connected {
        client_id: Uuid,
    },
    Registered {
        tunnel_id: u64,
        endpoint: Endpoint,
        local_addr: String,
    },
    RegisterFailed {
        spec: TunnelSpec,
        reason: RegisterFailReason,
    },
    Disconnected,
}

/// The client's session owner.
pub struct SessionManager {
    config: ClientConfig,
    transport: TransportConfig,
    refresher: Option<Arc<dyn TokenRefresher>>,
    token: Mutex<String>,
    intents: Mutex<Vec<TunnelIntent>>,
    /// tunnel id -> local target, read by the forwarder.
    tunnels: Arc<DashMap<u64, String>>,
    current_channel: Mutex<Option<Arc<ControlChannel>>>,
    events_tx: mpsc::Sender<TunnelEvent>,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl SessionManager {
    /// Build a manager and the event stream it reports through.
    pub fn new(config: ClientConfig) -> (Arc<Self>, mpsc::Receiver<TunnelEvent>) {
        Self::build(config, None)
    }

    /// Same, with a token refresher wired in.
    pub fn with_refresher(
        config: ClientConfig,
        refresher: Arc<dyn TokenRefresher>,
    ) -> (Arc<Self>, mpsc::Receiver<TunnelEvent>) {
        Self::build(config, Some(refresher))
    }

    fn build(
        config: ClientConfig,
        refresher: Option<Arc<dyn TokenRefresher>>,
    ) -> (Arc<Self>, mpsc::Receiver<TunnelEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let transport = TransportConfig::from_tls_config(&config.tls);
        let token = config.token.clone();
        (
            Arc::new(Self {
                config,
                transport,
                refresher,
                token: Mutex::new(token),
                intents: Mutex::new(Vec::new()),
                tunnels: Arc::new(DashMap::new()),
                current_channel: Mutex::new(None),
                events_tx,
                shutdown: CancellationToken::new(),
            }),
            events_rx,
        )
    }

    /// Record a tunnel intent; replayed on every (re)connect.
    pub fn add_tunnel(&self, intent: TunnelIntent) {
        lock(&self.intents).push(intent);
    }

    /// Install a new token immediately: used for later reconnects, and
    /// announced to the live session when there is one.
    pub async fn refresh_token(&self, new_token: String) -> Result<()> {
        *lock(&self.token) = new_token.clone();
        let channel = lock(&self.current_channel).clone();
        if let Some(channel) = channel {
            let reply = channel
                .request(|id| Message::TokenRefresh {
                    id,
                    token: new_token,
                })
                .await?;
            if !matches!(reply, Message::Ack { .. }) {
                return Err(TunnelError::Protocol("expected Ack".to_string()));
            }
        }
        Ok(())
    }

    /// Tear down one registered tunnel and forget its intent, so it is not
    /// replayed on the next reconnect. Idempotent on the wire.
    pub async fn close_tunnel(&self, tunnel_id: u64) -> Result<()> {
        let channel = lock(&self.current_channel)
            .clone()
            .ok_or(TunnelError::SessionClosed)?;
        let reply = channel
            .request(|id| Message::CloseTunnel { id, tunnel_id })
            .await?;
        if !matches!(reply, Message::Ack { .. }) {
            return Err(TunnelError::Protocol("expected Ack".to_string()));
        }
        self.tunnels.remove(&tunnel_id);
        lock(&self.intents).retain(|i| i.last_tunnel_id != Some(tunnel_id));
        Ok(())
    }

    /// The single cancellation point: stops backoff sleeps, closes every
    /// session, drains the pool.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Run until [`close`](Self::close). Reconnects with exponential
    /// backoff; gives up only when `max_reconnect_attempts` is configured
    /// and exceeded.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut backoff = Backoff::new(BackoffConfig {
            base: self.config.backoff_base,
            max: self.config.backoff_max,
            ..BackoffConfig::default()
        });

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.run_once().await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    warn!(error = %e, "connection attempt failed");
                }
            }

            if self.shutdown.is_cancelled() {
                return Ok(());
            }
            if let Some(max) = self.config.max_reconnect_attempts {
                if backoff.attempts() >= max {
                    return Err(TunnelError::Connection(
                        "reconnect attempts exhausted".to_string(),
                    ));
                }
            }

            let delay = backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connected epoch: establish, register, serve until the session
    /// dies or the manager closes. `Ok` means the session was operating.
    async fn run_once(self: &Arc<Self>) -> Result<()> {
        let primary = self.establish_primary().await?;
        let _ = self.events_tx.try_send(TunnelEvent::Connected {
            client_id: primary.client_id,
        });
        *lock(&self.current_channel) = Some(Arc::clone(&primary.channel));

        // Scope for this epoch's helper tasks (pool refill, accept loops).
        let scope = self.shutdown.child_token();
        self.tunnels.clear();
        let forwarder = Arc::new(LocalForwarder::new(
            Arc::clone(&self.tunnels),
            self.config.dial_timeout,
            DEFAULT_UDP_NAT_IDLE,
        ));

        let sessions: Arc<RwLock<Vec<MuxSession>>> =
            Arc::new(RwLock::new(vec![primary.session.clone()]));
        tokio::spawn(accept_loop(
            primary.session.clone(),
            Arc::clone(&forwarder),
            scope.clone(),
        ));

        // Registration replies must land before any data stream is served
        // for those tunnels, so register before warming the pool.
        if let Err(e) = self.register_all(&primary).await {
            primary.session.close();
            scope.cancel();
            *lock(&self.current_channel) = None;
            return Err(e);
        }

        // Secondary data sessions: extra stream-open parallelism only.
        let mut secondaries: Vec<ClientSession> = Vec::new();
        for _ in 0..self.config.data_sessions.min(MAX_DATA_SESSIONS) {
            let token = lock(&self.token).clone();
            match establish(
                &self.config,
                &self.transport,
                &token,
                Some(primary.client_id),
            )
            .await
            {
                Ok(secondary) => {
                    tokio::spawn(accept_loop(
                        secondary.session.clone(),
                        Arc::clone(&forwarder),
                        scope.clone(),
                    ));
                    if let Ok(mut list) = sessions.write() {
                        list.push(secondary.session.clone());
                    }
                    secondaries.push(secondary);
                }
                Err(e) => {
                    warn!(error = %e, "secondary session failed, continuing without");
                    break;
                }
            }
        }

        tokio::spawn(run_pool(
            Arc::clone(&sessions),
            self.config.stream_pool_size,
            Arc::clone(&forwarder),
            scope.clone(),
        ));

        info!(client_id = %primary.client_id, "tunnel client operating");

        let closed_token = primary.session.closed_token();
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = closed_token.cancelled() => {
                info!("session lost");
            }
        }

        let _ = self.events_tx.try_send(TunnelEvent::Disconnected);
        *lock(&self.current_channel) = None;
        scope.cancel();
        primary.session.close();
        for secondary in &secondaries {
            secondary.session.close();
        }
        Ok(())
    }

    async fn establish_primary(&self) -> Result<ClientSession> {
        let token = lock(&self.token).clone();
        match establish(&self.config, &self.transport, &token, None).await {
            Ok(session) => Ok(session),
            Err(EstablishError::Auth(AuthFailReason::TokenExpired)) => {
                let Some(refresher) = &self.refresher else {
                    return Err(TunnelError::Authentication(
                        "token expired and no refresher configured".to_string(),
                    ));
                };
                info!("token expired, invoking refresher");
                let new_token = refresher.refresh(&token)?;
                *lock(&self.token) = new_token.clone();
                establish(&self.config, &self.transport, &new_token, None)
                    .await
                    .map_err(|e| match e {
                        EstablishError::Auth(reason) => {
                            TunnelError::Authentication(format!("{reason:?}"))
                        }
                        EstablishError::Other(err) => err,
                    })
            }
            Err(EstablishError::Auth(reason)) => {
                Err(TunnelError::Authentication(format!("{reason:?}")))
            }
            Err(EstablishError::Other(e)) => Err(e),
        }
    }

    /// Re-issue every stored intent on the fresh session.
    async fn register_all(&self, primary: &ClientSession) -> Result<()> {
        let snapshot: Vec<TunnelIntent> = lock(&self.intents).clone();

        for (idx, intent) in snapshot.into_iter().enumerate() {
            let mut spec = intent.spec.clone();
            let mut pinned = intent.pinned;

            loop {
                let reply = primary
                    .channel
                    .request(|id| Message::RegisterTunnel {
                        id,
                        spec: spec.clone(),
                        local_hint: intent.local_addr.clone(),
                    })
                    .await?;

                match reply {
                    Message::TunnelRegistered {
                        tunnel_id,
                        endpoint,
                        ..
                    } => {
                        self.tunnels.insert(tunnel_id, intent.local_addr.clone());
                        if let Some(stored) = lock(&self.intents).get_mut(idx) {
                            stored.last_tunnel_id = Some(tunnel_id);
                        }
                        self.pin_assigned_port(idx, &endpoint);
                        info!(tunnel_id, endpoint = %endpoint, "tunnel up");
                        let _ = self.events_tx.try_send(TunnelEvent::Registered {
                            tunnel_id,
                            endpoint,
                            local_addr: intent.local_addr.clone(),
                        });
                        break;
                    }
                    Message::RegisterFail {
                        reason: RegisterFailReason::PortTaken,
                        ..
                    } if pinned => {
                        // The replayed port went to someone else while we
                        // were away; any free port will do.
                        debug!("pinned port taken on replay, requesting any port");
                        pinned = false;
                        if let TunnelSpec::Tcp { port } | TunnelSpec::Udp { port } = &mut spec {
                            *port = 0;
                        }
                        let mut intents = lock(&self.intents);
                        if let Some(stored) = intents.get_mut(idx) {
                            stored.spec = spec.clone();
                            stored.pinned = false;
                        }
                        continue;
                    }
                    Message::RegisterFail { reason, .. } => {
                        warn!(%reason, "registration rejected");
                        let _ = self.events_tx.try_send(TunnelEvent::RegisterFailed {
                            spec: spec.clone(),
                            reason,
                        });
                        break;
                    }
                    other => {
                        return Err(TunnelError::Protocol(format!(
                            "unexpected registration reply: {other:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn pin_assigned_port(&self, idx: usize, endpoint: &Endpoint) {
        let assigned = match endpoint {
            Endpoint::Tcp { port } | Endpoint::Udp { port } => *port,
            Endpoint::Http { .. } => return,
        };
        let mut intents = lock(&self.intents);
        if let Some(stored) = intents.get_mut(idx) {
            if let TunnelSpec::Tcp { port } | TunnelSpec::Udp { port } = &mut stored.spec {
                if *port == 0 {
                    *port = assigned;
                    stored.pinned = true;
                }
            }
        }
    }
}

/// Serve server-opened streams on one session until it closes.
async fn accept_loop(
    session: MuxSession,
    forwarder: Arc<LocalForwarder>,
    scope: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = scope.cancelled() => return,
            res = session.accept_stream() => match res {
                Ok(stream) => stream,
                Err(_) => return,
            },
        };
        let forwarder = Arc::clone(&forwarder);
        let scope = scope.clone();
        tokio::spawn(async move {
            forwarder.serve(stream, None, scope).await;
        });
    }
}
