//! Connected-client bookkeeping and stream pickup
//!
//! One [`ClientHandle`] exists per authenticated client identity; the
//! primary session and any secondary data sessions all point at it. The
//! handle also queues streams the client pre-opened (its pool) so ingress
//! dispatch pays no stream-open round trip on the hot path.

use burrow_core::mux::Multiplexer;
use burrow_core::VirtualStream;
use burrow_common::{Result, TunnelError};
use burrow_protocol::message::Quotas;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Depth of the per-client queue of pre-opened streams. The client bounds
/// its own pool; this only has to be at least as large.
const PICKUP_QUEUE_DEPTH: usize = 512;

/// One authenticated client identity and its sessions.
pub struct ClientHandle {
    pub client_id: Uuid,
    pub user_id: String,
    pub quotas: Quotas,
    pub allowed_subdomains: Vec<String>,
    /// Current token; refreshed via `TokenRefresh`, checked when secondary
    /// sessions attach.
    token: RwLock<String>,
    /// Session multiplexers; index 0 is the primary.
    sessions: RwLock<Vec<Multiplexer>>,
    /// Streams the client pre-opened, waiting for pickup.
    pooled_tx: kanal::AsyncSender<VirtualStream>,
    pooled_rx: kanal::AsyncReceiver<VirtualStream>,
    /// Round-robin cursor over data sessions for fallback opens.
    rr: AtomicUsize,
}

impl ClientHandle {
    pub fn new(
        client_id: Uuid,
        user_id: String,
        quotas: Quotas,
        allowed_subdomains: Vec<String>,
        token: String,
        primary: Multiplexer,
    ) -> Arc<Self> {
        let (pooled_tx, pooled_rx) = kanal::bounded_async(PICKUP_QUEUE_DEPTH);
        Arc::new(Self {
            client_id,
            user_id,
            quotas,
            allowed_subdomains,
            token: RwLock::new(token),
            sessions: RwLock::new(vec![primary]),
            pooled_tx,
            pooled_rx,
            rr: AtomicUsize::new(0),
        })
    }

    pub fn token_matches(&self, token: &str) -> bool {
        self.token
            .read()
            .map(|t| crate::auth::constant_time_eq(t.as_bytes(), token.as_bytes()))
            .unwrap_or(false)
    }

    pub fn set_token(&self, token: String) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    /// Attach a secondary data session.
    pub fn add_session(&self, mux: Multiplexer) {
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.push(mux);
        }
    }

    /// Drop dead secondary sessions from the pick list. The primary slot is
    /// kept: primary death tears the whole client down instead.
    pub fn prune_dead_sessions(&self) {
        let Ok(mut sessions) = self.sessions.write() else {
            return;
        };
        let before = sessions.len();
        let mut keep_first = true;
        sessions.retain(|s| {
            let keep = std::mem::take(&mut keep_first) || !s.is_closed();
            keep
        });
        if before > sessions.len() {
            debug!(
                client_id = %self.client_id,
                removed = before - sessions.len(),
                "pruned dead data sessions"
            );
        }
    }

    /// Queue a stream the client pre-opened. A full queue refuses the
    /// stream; the client's pool is misbehaving if this ever triggers.
    pub fn offer_pooled(&self, stream: VirtualStream) {
        if !matches!(self.pooled_tx.try_send(stream), Ok(true)) {
            debug!(client_id = %self.client_id, "pickup queue full, dropping stream");
        }
    }

    /// Get a stream to this client for ingress dispatch.
    ///
    /// Fast path: pop a pre-opened stream. Fallback: open one ourselves,
    /// round-robin over the data sessions, then the primary.
    pub async fn acquire_stream(&self) -> Result<VirtualStream> {
        while let Ok(Some(stream)) = self.pooled_rx.try_recv() {
            if !stream.is_closed() {
                return Ok(stream);
            }
        }

        let sessions: Vec<Multiplexer> = self
            .sessions
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        if sessions.is_empty() {
            return Err(TunnelError::SessionClosed);
        }

        if sessions.len() > 1 {
            let data_count = sessions.len() - 1;
            let start = self.rr.fetch_add(1, Ordering::Relaxed);
            for i in 0..data_count {
                let idx = 1 + (start + i) % data_count;
                if let Ok(stream) = sessions[idx].open_stream().await {
                    return Ok(stream);
                }
            }
        }
        sessions[0].open_stream().await
    }

    /// Close every session of this client.
    pub fn close_all_sessions(&self) {
        if let Ok(sessions) = self.sessions.read() {
            for mux in sessions.iter() {
                mux.close();
            }
        }
        self.pooled_tx.close();
    }
}

/// All currently connected client identities.
#[derive(Default)]
pub struct ClientMap {
    clients: DashMap<Uuid, Arc<ClientHandle>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: Arc<ClientHandle>) {
        self.clients.insert(handle.client_id, handle);
    }

    pub fn get(&self, client_id: &Uuid) -> Option<Arc<ClientHandle>> {
        self.clients.get(client_id).map(|r| Arc::clone(&r))
    }

    pub fn remove(&self, client_id: &Uuid) -> Option<Arc<ClientHandle>> {
        self.clients.remove(client_id).map(|(_, h)| h)
    }

    pub fn count(&self) -> usize {
        self.clients.len()
    }
}
