//! Local forwarder
//!
//! Every stream the server dedicates to this client starts with the inline
//! header. TCP/HTTP streams dial the tunnel's configured local target and
//! splice bytes; UDP bridge streams demultiplex datagram frames against
//! per-source local sockets so replies correlate to the right public
//! sender.

use burrow_core::VirtualStream;
use burrow_protocol::header::{
    read_datagram, read_header, write_datagram, StreamHeader,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Splice buffer per direction; matches the mux data chunk.
const SPLICE_BUFFER_SIZE: usize = 64 * 1024;

const MAX_DATAGRAM: usize = 65_535;

/// Dispatches server-opened (or server-consumed pooled) streams to local
/// services.
pub struct LocalForwarder {
    /// tunnel id -> local target address, maintained by the manager from
    /// registration replies.
    tunnels: Arc<DashMap<u64, String>>,
    dial_timeout: Duration,
    udp_idle: Duration,
}

impl LocalForwarder {
    pub fn new(
        tunnels: Arc<DashMap<u64, String>>,
        dial_timeout: Duration,
        udp_idle: Duration,
    ) -> Self {
        Self {
            tunnels,
            dial_timeout,
            udp_idle,
        }
    }

    /// Serve one dedicated stream. `permit`, when present, is pool capacity
    /// released the moment the server consumes the stream (header read), so
    /// the pool refills while the connection is still in flight.
    pub async fn serve(
        &self,
        mut stream: VirtualStream,
        permit: Option<OwnedSemaphorePermit>,
        shutdown: CancellationToken,
    ) {
        let header = tokio::select! {
            _ = shutdown.cancelled() => return,
            header = read_header(&mut stream) => header,
        };
        drop(permit);

        let header = match header {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "stream ended before header");
                return;
            }
        };

        match header {
            StreamHeader::Stream {
                tunnel_id,
                remote_addr,
                ..
            } => self.serve_stream(stream, tunnel_id, &remote_addr).await,
            StreamHeader::Datagrams { tunnel_id } => {
                self.serve_datagrams(stream, tunnel_id).await;
            }
        }
    }

    async fn serve_stream(&self, mut stream: VirtualStream, tunnel_id: u64, remote_addr: &str) {
        let Some(local_addr) = self.tunnels.get(&tunnel_id).map(|r| r.clone()) else {
            debug!(tunnel_id, "stream for unknown tunnel, closing");
            return;
        };

        // A failed dial closes the stream with zero bytes written; the
        // server translates that into 502 / connection reset.
        let sock = match tokio::time::timeout(
            self.dial_timeout,
            TcpStream::connect(&local_addr),
        )
        .await
        {
            Ok(Ok(sock)) => sock,
            Ok(Err(e)) => {
                warn!(tunnel_id, local = %local_addr, error = %e, "local dial failed");
                return;
            }
            Err(_) => {
                warn!(tunnel_id, local = %local_addr, "local dial timed out");
                return;
            }
        };
        let _ = sock.set_nodelay(true);

        let mut sock = sock;
        match tokio::io::copy_bidirectional_with_sizes(
            &mut stream,
            &mut sock,
            SPLICE_BUFFER_SIZE,
            SPLICE_BUFFER_SIZE,
        )
        .await
        {
            Ok((from_public, from_local)) => {
                debug!(
                    tunnel_id,
                    remote = remote_addr,
                    bytes_in = from_public,
                    bytes_out = from_local,
                    "stream closed"
                );
            }
            Err(e) => debug!(tunnel_id, error = %e, "splice ended with error"),
        }
    }

    /// Bridge a UDP tunnel stream against the local service.
    ///
    /// One local socket per public source: replies read off a socket carry
    /// that source's tag back, which is what keeps two senders' traffic
    /// apart. Idle sources age out on the same interval as the server's NAT
    /// table.
    async fn serve_datagrams(&self, stream: VirtualStream, tunnel_id: u64) {
        let Some(local_addr) = self.tunnels.get(&tunnel_id).map(|r| r.clone()) else {
            debug!(tunnel_id, "datagram bridge for unknown tunnel, closing");
            return;
        };

        let (mut reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(writer));
        let scope = CancellationToken::new();
        let mut sources: HashMap<String, BridgeEntry> = HashMap::new();
        let mut last_sweep = Instant::now();

        loop {
            let datagram = match read_datagram(&mut reader).await {
                Ok(Some(d)) => d,
                Ok(None) => break,
                Err(e) => {
                    debug!(tunnel_id, error = %e, "bridge stream ended");
                    break;
                }
            };

            if last_sweep.elapsed() >= self.udp_idle {
                sources.retain(|_, entry| {
                    let keep = entry.last_seen.elapsed() < self.udp_idle;
                    if !keep {
                        entry.stop.cancel();
                    }
                    keep
                });
                last_sweep = Instant::now();
            }

            if !sources.contains_key(&datagram.src_addr) {
                match BridgeEntry::open(
                    &local_addr,
                    datagram.src_addr.clone(),
                    Arc::clone(&writer),
                    scope.child_token(),
                )
                .await
                {
                    Ok(entry) => {
                        sources.insert(datagram.src_addr.clone(), entry);
                    }
                    Err(e) => {
                        debug!(tunnel_id, error = %e, "local udp socket failed");
                        continue;
                    }
                }
            }
            let Some(entry) = sources.get_mut(&datagram.src_addr) else {
                continue;
            };

            entry.last_seen = Instant::now();
            if let Err(e) = entry.socket.send(&datagram.payload).await {
                debug!(tunnel_id, error = %e, "local udp send failed");
            }
        }

        scope.cancel();
    }
}

type BridgeWriter = Arc<Mutex<WriteHalf<VirtualStream>>>;

/// One public source's local socket and its reply pump.
struct BridgeEntry {
    socket: Arc<UdpSocket>,
    last_seen: Instant,
    stop: CancellationToken,
}

impl BridgeEntry {
    async fn open(
        local_addr: &str,
        src_tag: String,
        writer: BridgeWriter,
        stop: CancellationToken,
    ) -> std::io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(local_addr).await?;

        let reply_socket = Arc::clone(&socket);
        let reply_stop = stop.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let received = tokio::select! {
                    _ = reply_stop.cancelled() => return,
                    received = reply_socket.recv(&mut buf) => received,
                };
                let len = match received {
                    Ok(len) => len,
                    Err(_) => return,
                };
                let mut w = writer.lock().await;
                if write_datagram(&mut *w, &src_tag, &buf[..len]).await.is_err() {
                    return;
                }
                let _ = w.flush().await;
            }
        });

        Ok(Self {
            socket,
            last_seen: Instant::now(),
            stop,
        })
    }
}
