//! UDP ingress dispatcher
//!
//! One public UDP socket per tunnel. All senders share a single long-lived
//! tunnel stream carrying length-prefixed datagram frames tagged with the
//! public source address; a NAT table remembers sources so reply frames
//! find their way back. Datagram semantics are preserved end to end: a
//! frame that cannot be written is dropped, never retransmitted.

use crate::clients::ClientHandle;
use crate::registry::TunnelRecord;
use burrow_core::VirtualStream;
use burrow_protocol::header::{read_datagram, write_datagram, write_datagram_header};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 65_535;

/// Ingress loop for one leased UDP port. Runs until the tunnel stops.
pub(crate) async fn run_udp_tunnel(
    socket: Arc<UdpSocket>,
    record: Arc<TunnelRecord>,
    client: Arc<ClientHandle>,
    nat_idle: Duration,
) {
    info!(
        tunnel_id = record.id,
        endpoint = %record.endpoint,
        "udp tunnel listening"
    );

    let nat: Arc<DashMap<SocketAddr, Instant>> = Arc::new(DashMap::new());

    // Expiry sweep: drop sources idle past the threshold. Evicted entries
    // get no notification; late replies are dropped.
    {
        let nat = Arc::clone(&nat);
        let stop = record.stop.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(nat_idle / 2);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let now = Instant::now();
                nat.retain(|_, last_seen| now.duration_since(*last_seen) < nat_idle);
            }
        });
    }

    let mut writer: Option<WriteHalf<VirtualStream>> = None;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = record.stop.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, src) = match received {
            Ok(pair) => pair,
            Err(e) => {
                if record.stop.is_cancelled() {
                    break;
                }
                warn!(tunnel_id = record.id, error = %e, "udp recv error");
                continue;
            }
        };

        // Open the shared stream on demand; recreate it on the next
        // datagram after a failure.
        if writer.is_none() {
            match open_bridge(&record, &client, &socket, &nat).await {
                Some(w) => writer = Some(w),
                None => continue, // drop the datagram, UDP semantics
            }
        }

        if let Some(w) = writer.as_mut() {
            if let Err(e) = write_datagram(w, &src.to_string(), &buf[..len]).await {
                debug!(tunnel_id = record.id, error = %e, "bridge stream died");
                writer = None;
                continue;
            }
        }

        nat.insert(src, Instant::now());
        record.stats.add_in(len as u64);
    }

    info!(tunnel_id = record.id, "udp tunnel stopped");
}

/// Acquire a stream, send the bridge header, and spawn the reply reader.
async fn open_bridge(
    record: &Arc<TunnelRecord>,
    client: &Arc<ClientHandle>,
    socket: &Arc<UdpSocket>,
    nat: &Arc<DashMap<SocketAddr, Instant>>,
) -> Option<WriteHalf<VirtualStream>> {
    let mut stream = match client.acquire_stream().await {
        Ok(s) => s,
        Err(_) => {
            debug!(tunnel_id = record.id, "no session for udp bridge");
            return None;
        }
    };
    if let Err(e) = write_datagram_header(&mut stream, record.id).await {
        debug!(tunnel_id = record.id, error = %e, "bridge header write failed");
        return None;
    }

    let (read_half, write_half) = tokio::io::split(stream);
    tokio::spawn(read_replies(
        read_half,
        Arc::clone(record),
        Arc::clone(socket),
        Arc::clone(nat),
    ));
    Some(write_half)
}

/// Demultiplex reply frames back onto the public socket.
async fn read_replies(
    mut reader: ReadHalf<VirtualStream>,
    record: Arc<TunnelRecord>,
    socket: Arc<UdpSocket>,
    nat: Arc<DashMap<SocketAddr, Instant>>,
) {
    loop {
        let datagram = tokio::select! {
            _ = record.stop.cancelled() => return,
            result = read_datagram(&mut reader) => match result {
                Ok(Some(d)) => d,
                Ok(None) => return,
                Err(e) => {
                    debug!(tunnel_id = record.id, error = %e, "bridge reader ended");
                    return;
                }
            },
        };

        let Ok(dest) = datagram.src_addr.parse::<SocketAddr>() else {
            debug!(tunnel_id = record.id, src = %datagram.src_addr, "bad reply tag");
            continue;
        };
        // Reply for an evicted source: silent drop.
        if nat.get(&dest).is_none() {
            continue;
        }
        match socket.send_to(&datagram.payload, dest).await {
            Ok(n) => record.stats.add_out(n as u64),
            Err(e) => debug!(tunnel_id = record.id, error = %e, "udp reply send failed"),
        }
    }
}
