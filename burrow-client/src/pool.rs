//! Stream pool
//!
//! Pre-opens outbound streams so ingress dispatch on the server pays no
//! stream-open round trip. A refill task keeps up to `size` streams parked
//! on the header read, opening them round-robin across all usable sessions
//! from a monotonically advancing index. Capacity frees the moment the
//! server consumes a stream, not when its connection finishes.

use crate::forwarder::LocalForwarder;
use burrow_core::mux::MuxSession;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pause before retrying when no session can open a stream.
const NO_SESSION_RETRY: Duration = Duration::from_millis(10);

/// Refill loop; runs until `shutdown` fires. Parked streams die with their
/// sessions, so shutdown only has to stop the refill.
pub(crate) async fn run_pool(
    sessions: Arc<RwLock<Vec<MuxSession>>>,
    size: usize,
    forwarder: Arc<LocalForwarder>,
    shutdown: CancellationToken,
) {
    let capacity = Arc::new(Semaphore::new(size));
    let cursor = AtomicUsize::new(0);

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return,
            permit = Arc::clone(&capacity).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        let stream = loop {
            if shutdown.is_cancelled() {
                return;
            }

            let candidates: Vec<MuxSession> = sessions
                .read()
                .map(|s| s.iter().filter(|s| !s.is_closed()).cloned().collect())
                .unwrap_or_default();

            if candidates.is_empty() {
                tokio::time::sleep(NO_SESSION_RETRY).await;
                continue;
            }

            let start = cursor.fetch_add(1, Ordering::Relaxed);
            let mut opened = None;
            for i in 0..candidates.len() {
                let session = &candidates[(start + i) % candidates.len()];
                match session.open_stream().await {
                    Ok(stream) => {
                        opened = Some(stream);
                        break;
                    }
                    Err(e) => debug!(error = %e, "pool open failed, trying next session"),
                }
            }
            match opened {
                Some(stream) => break stream,
                None => tokio::time::sleep(NO_SESSION_RETRY).await,
            }
        };

        // Park the stream on its header read; the permit rides along and
        // releases once the server picks the stream up.
        let forwarder = Arc::clone(&forwarder);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            forwarder.serve(stream, Some(permit), shutdown).await;
        });
    }
}
