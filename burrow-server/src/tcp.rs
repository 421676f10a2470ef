//! TCP ingress dispatcher
//!
//! One listener per TCP tunnel, bound to the leased port at registration.
//! Each accepted connection gets a fresh tunnel stream: a small inline
//! header, then a bidirectional splice until either side closes.

use crate::clients::ClientHandle;
use crate::registry::TunnelRecord;
use burrow_protocol::header::{write_stream_header, StreamKind};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Splice buffer per direction; matches the mux data chunk so one read maps
/// to one frame.
const SPLICE_BUFFER_SIZE: usize = 64 * 1024;

/// Accept loop for one leased TCP port. Runs until the tunnel's stop token
/// fires; accept errors other than listener shutdown are logged and the
/// loop continues.
pub(crate) async fn run_tcp_tunnel(
    listener: TcpListener,
    record: Arc<TunnelRecord>,
    client: Arc<ClientHandle>,
) {
    info!(
        tunnel_id = record.id,
        endpoint = %record.endpoint,
        "tcp tunnel listening"
    );

    loop {
        let accepted = tokio::select! {
            _ = record.stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((sock, peer_addr)) => {
                if let Err(e) = sock.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }
                let record = Arc::clone(&record);
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    if let Err(e) = forward_connection(sock, &record, &client).await {
                        debug!(
                            tunnel_id = record.id,
                            peer = %peer_addr,
                            error = %e,
                            "tcp forward ended with error"
                        );
                    }
                });
            }
            Err(e) => {
                if record.stop.is_cancelled() {
                    break;
                }
                warn!(tunnel_id = record.id, error = %e, "tcp accept error");
            }
        }
    }

    info!(tunnel_id = record.id, "tcp tunnel stopped");
}

async fn forward_connection(
    mut sock: TcpStream,
    record: &Arc<TunnelRecord>,
    client: &Arc<ClientHandle>,
) -> std::io::Result<()> {
    let peer_addr = sock.peer_addr()?;

    // Tunnel became unavailable between accept and stream-open: reset the
    // public connection by dropping it.
    let mut stream = match client.acquire_stream().await {
        Ok(s) => s,
        Err(_) => {
            debug!(tunnel_id = record.id, "no session for accepted connection");
            return Ok(());
        }
    };

    write_stream_header(
        &mut stream,
        StreamKind::Tcp,
        record.id,
        &peer_addr.to_string(),
    )
    .await?;

    let (to_client, to_public) = tokio::io::copy_bidirectional_with_sizes(
        &mut sock,
        &mut stream,
        SPLICE_BUFFER_SIZE,
        SPLICE_BUFFER_SIZE,
    )
    .await?;

    record.stats.add_in(to_client);
    record.stats.add_out(to_public);
    debug!(
        tunnel_id = record.id,
        peer = %peer_addr,
        bytes_in = to_client,
        bytes_out = to_public,
        "tcp forward closed"
    );
    Ok(())
}
