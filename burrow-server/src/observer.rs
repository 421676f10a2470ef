//! Traffic observation
//!
//! The HTTP dispatcher can tee request/response heads plus a bounded body
//! prefix to an observer (the inspector UI feeds off this). Observation is
//! strictly best-effort: the queue never blocks the forwarding path, and a
//! full queue drops the observation, not the request.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::debug;

/// One captured HTTP exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub host: String,
    pub method: String,
    pub uri: String,
    pub remote_addr: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: Vec<u8>,
    pub status: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Vec<u8>,
    pub started_at: SystemTime,
    pub duration: Duration,
}

/// Receives copies of HTTP exchanges. Must not block.
pub trait TrafficObserver: Send + Sync {
    fn on_http_exchange(&self, record: ExchangeRecord);
}

/// Bounded ring of recent exchanges, insertion-order eviction, one ring per
/// server process.
pub struct ExchangeLog {
    entries: Mutex<VecDeque<ExchangeRecord>>,
    max_entries: usize,
}

impl ExchangeLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Snapshot of the ring, oldest first.
    pub fn snapshot(&self) -> Vec<ExchangeRecord> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TrafficObserver for ExchangeLog {
    fn on_http_exchange(&self, record: ExchangeRecord) {
        if let Ok(mut entries) = self.entries.lock() {
            if entries.len() == self.max_entries {
                entries.pop_front();
            }
            entries.push_back(record);
        }
    }
}

/// Handle the dispatcher pushes observations through.
#[derive(Clone)]
pub struct ObserverQueue {
    tx: Option<mpsc::Sender<ExchangeRecord>>,
    /// Body capture limit handed to the dispatcher's tee.
    pub max_body_size: usize,
}

impl ObserverQueue {
    /// No observer configured: every push is a no-op.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            max_body_size: 0,
        }
    }

    /// Spawn the drain task feeding `observer`.
    pub fn spawn(
        observer: Arc<dyn TrafficObserver>,
        queue_depth: usize,
        max_body_size: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExchangeRecord>(queue_depth);
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                observer.on_http_exchange(record);
            }
        });
        Self {
            tx: Some(tx),
            max_body_size,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Push without blocking; a full queue drops the observation.
    pub fn push(&self, record: ExchangeRecord) {
        if let Some(tx) = &self.tx {
            if tx.try_send(record).is_err() {
                debug!("observer queue full, dropping exchange record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(uri: &str) -> ExchangeRecord {
        ExchangeRecord {
            host: "myapp.example.test".into(),
            method: "GET".into(),
            uri: uri.into(),
            remote_addr: "203.0.113.9:55123".into(),
            request_headers: vec![],
            request_body: vec![],
            status: 200,
            response_headers: vec![],
            response_body: vec![],
            started_at: SystemTime::now(),
            duration: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let log = ExchangeLog::new(2);
        log.on_http_exchange(record("/a"));
        log.on_http_exchange(record("/b"));
        log.on_http_exchange(record("/c"));

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].uri, "/b");
        assert_eq!(entries[1].uri, "/c");
    }

    #[tokio::test]
    async fn test_queue_drains_to_observer() {
        let log = Arc::new(ExchangeLog::new(16));
        let queue = ObserverQueue::spawn(log.clone(), 8, 4096);

        queue.push(record("/ping"));

        // Give the drain task a beat.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_disabled_queue_is_noop() {
        let queue = ObserverQueue::disabled();
        queue.push(record("/x"));
        assert!(!queue.is_enabled());
    }
}
