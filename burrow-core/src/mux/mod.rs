//! Stream multiplexer
//!
//! Carries many independent bidirectional streams over one framed transport
//! with per-stream credit-based flow control, half-close semantics, and a
//! keepalive probe. Stream 0 is the control stream and exists implicitly on
//! both ends; the client allocates odd ids, the server even ids.
//!
//! Any framing error, credit violation, or keepalive timeout is fatal to the
//! whole session: every stream and every waiter observes a single terminal
//! closed condition.

pub mod stream;

use crate::transport::BoxedStream;
use burrow_common::{Result, TunnelError};
use burrow_protocol::codec::MuxCodec;
use burrow_protocol::constants::{
    CLIENT_FIRST_STREAM_ID, CONTROL_STREAM_ID, SERVER_FIRST_STREAM_ID,
};
use burrow_protocol::frame::MuxFrame;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use stream::{StreamEvent, StreamShared};
pub use stream::VirtualStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Which end of the session this multiplexer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Client,
    Server,
}

/// Keepalive tuning for a session.
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveConfig {
    /// Probe interval.
    pub interval: Duration,
    /// A probe unanswered for this long kills the session.
    pub dead_after: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: burrow_common::constants::DEFAULT_PING_INTERVAL,
            dead_after: burrow_common::constants::DEFAULT_DEAD_SESSION_AFTER,
        }
    }
}

pub(crate) struct StreamEntry {
    pub(crate) inbound: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) shared: Arc<StreamShared>,
}

pub(crate) struct MuxInner {
    role: SessionRole,
    pub(crate) streams: Arc<DashMap<u32, StreamEntry>>,
    next_stream_id: AtomicU32,
    pub(crate) data_tx: kanal::AsyncSender<MuxFrame>,
    pub(crate) ctrl_tx: mpsc::UnboundedSender<MuxFrame>,
    accept_tx: kanal::AsyncSender<VirtualStream>,
    pings: DashMap<u64, oneshot::Sender<()>>,
    ping_nonce: AtomicU64,
    pub(crate) shutdown: CancellationToken,
    go_away: AtomicBool,
    control: Mutex<Option<VirtualStream>>,
}

/// Receiving ends the session runner wires to the transport.
pub struct MuxHandles {
    pub data_rx: kanal::AsyncReceiver<MuxFrame>,
    pub ctrl_rx: mpsc::UnboundedReceiver<MuxFrame>,
    pub accept_rx: kanal::AsyncReceiver<VirtualStream>,
}

/// Manages the virtual streams of one session.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.inner.role)
            .field("streams", &self.inner.streams.len())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create a multiplexer plus the channel ends its I/O tasks consume.
    ///
    /// Ordered frames (open, data, fin) flow through the bounded data
    /// channel; bookkeeping frames (window updates, resets, pings) take the
    /// unbounded control channel and may overtake data.
    pub fn new(role: SessionRole) -> (Self, MuxHandles) {
        let (data_tx, data_rx) = kanal::bounded_async(1024);
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
        // Deep enough to absorb a client warming its whole stream pool in
        // one burst before the accept consumer runs.
        let (accept_tx, accept_rx) = kanal::bounded_async(1024);

        let first_id = match role {
            SessionRole::Client => CLIENT_FIRST_STREAM_ID,
            SessionRole::Server => SERVER_FIRST_STREAM_ID,
        };

        let inner = Arc::new(MuxInner {
            role,
            streams: Arc::new(DashMap::new()),
            next_stream_id: AtomicU32::new(first_id),
            data_tx,
            ctrl_tx,
            accept_tx,
            pings: DashMap::new(),
            ping_nonce: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            go_away: AtomicBool::new(false),
            control: Mutex::new(None),
        });

        let mux = Self { inner };

        // Stream 0 exists implicitly on both ends.
        let control = mux.register_stream(CONTROL_STREAM_ID);
        if let Ok(mut slot) = mux.inner.control.lock() {
            *slot = Some(control);
        }

        (
            mux,
            MuxHandles {
                data_rx,
                ctrl_rx,
                accept_rx,
            },
        )
    }

    fn register_stream(&self, stream_id: u32) -> VirtualStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(stream_id, &self.inner));
        self.inner.streams.insert(
            stream_id,
            StreamEntry {
                inbound: tx,
                shared: Arc::clone(&shared),
            },
        );
        VirtualStream::new(shared, rx)
    }

    /// Take the control stream. Yields once per session.
    pub fn take_control_stream(&self) -> Option<VirtualStream> {
        self.inner.control.lock().ok()?.take()
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> Result<VirtualStream> {
        if self.is_closed() || self.inner.go_away.load(Ordering::Acquire) {
            return Err(TunnelError::SessionClosed);
        }

        let stream_id = self.inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let stream = self.register_stream(stream_id);

        if self
            .inner
            .data_tx
            .send(MuxFrame::OpenStream { stream_id })
            .await
            .is_err()
        {
            self.inner.streams.remove(&stream_id);
            return Err(TunnelError::SessionClosed);
        }
        Ok(stream)
    }

    /// Round-trip a probe and report its latency.
    pub async fn ping(&self) -> Result<Duration> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }

        let nonce = self.inner.ping_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pings.insert(nonce, tx);

        let start = Instant::now();
        if self.inner.ctrl_tx.send(MuxFrame::Ping { nonce }).is_err() {
            self.inner.pings.remove(&nonce);
            return Err(TunnelError::SessionClosed);
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(TunnelError::SessionClosed),
            res = rx => match res {
                Ok(()) => Ok(start.elapsed()),
                Err(_) => Err(TunnelError::SessionClosed),
            },
        }
    }

    /// Route one inbound frame. An `Err` is a protocol violation and must
    /// kill the session.
    pub async fn process_frame(&self, frame: MuxFrame) -> Result<()> {
        match frame {
            MuxFrame::OpenStream { stream_id } => {
                let expected_parity = match self.inner.role {
                    SessionRole::Client => SERVER_FIRST_STREAM_ID % 2,
                    SessionRole::Server => CLIENT_FIRST_STREAM_ID % 2,
                };
                if stream_id == CONTROL_STREAM_ID || stream_id % 2 != expected_parity {
                    return Err(TunnelError::Protocol(format!(
                        "peer opened invalid stream id {stream_id}"
                    )));
                }

                if self.inner.streams.contains_key(&stream_id) {
                    return Err(TunnelError::Protocol(format!(
                        "peer reopened live stream {stream_id}"
                    )));
                }
                let stream = self.register_stream(stream_id);

                match self.inner.accept_tx.try_send(stream) {
                    Ok(true) => {}
                    _ => {
                        // Accept queue full or closed: refuse rather than
                        // stall the whole session read loop.
                        warn!(stream_id, "accept queue rejected incoming stream");
                        self.inner.streams.remove(&stream_id);
                        let _ = self.inner.ctrl_tx.send(MuxFrame::ResetStream { stream_id });
                    }
                }
            }
            MuxFrame::Data {
                stream_id,
                data,
                fin,
            } => {
                let entry = match self.inner.streams.get(&stream_id) {
                    Some(e) => (e.inbound.clone(), Arc::clone(&e.shared)),
                    None => {
                        debug!(stream_id, "data frame for unknown stream");
                        return Ok(());
                    }
                };
                let (inbound, shared) = entry;

                if !data.is_empty() {
                    let left = shared
                        .recv_budget
                        .fetch_sub(data.len() as i64, Ordering::AcqRel);
                    if left < data.len() as i64 {
                        return Err(TunnelError::Protocol(format!(
                            "flow-control violation on stream {stream_id}"
                        )));
                    }
                    let _ = inbound.send(StreamEvent::Data(data));
                }
                if fin {
                    let _ = inbound.send(StreamEvent::Fin);
                    shared.remote_fin.store(true, Ordering::Release);
                    shared.maybe_remove();
                }
            }
            MuxFrame::WindowUpdate { stream_id, delta } => {
                if let Some(entry) = self.inner.streams.get(&stream_id) {
                    entry.shared.send_window.add(delta);
                } else {
                    debug!(stream_id, "window update for unknown stream");
                }
            }
            MuxFrame::ResetStream { stream_id } => {
                if let Some((_, entry)) = self.inner.streams.remove(&stream_id) {
                    let _ = entry.inbound.send(StreamEvent::Reset);
                }
            }
            MuxFrame::Ping { nonce } => {
                let _ = self.inner.ctrl_tx.send(MuxFrame::Pong { nonce });
            }
            MuxFrame::Pong { nonce } => {
                if let Some((_, waiter)) = self.inner.pings.remove(&nonce) {
                    let _ = waiter.send(());
                }
            }
            MuxFrame::GoAway { code } => {
                debug!(code, "peer sent go-away");
                self.inner.go_away.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Terminal close: every stream and waiter observes the session as
    /// closed. Idempotent.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.go_away.store(true, Ordering::Release);
        let _ = self.inner.ctrl_tx.send(MuxFrame::GoAway { code: 0 });
        self.inner.shutdown.cancel();

        for entry in self.inner.streams.iter() {
            let _ = entry.inbound.send(StreamEvent::Reset);
        }
        self.inner.streams.clear();
        self.inner.pings.clear();
        self.inner.accept_tx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Token cancelled when the session dies.
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }
}

type MuxSink = SplitSink<Framed<BoxedStream, MuxCodec>, MuxFrame>;
type MuxStream = SplitStream<Framed<BoxedStream, MuxCodec>>;

/// Writer task: single owner of the write half.
///
/// Control frames are drained preferentially; data frames arrive through the
/// bounded channel and provide the session's backpressure.
async fn run_writer(
    mut sink: MuxSink,
    data_rx: kanal::AsyncReceiver<MuxFrame>,
    mut ctrl_rx: mpsc::UnboundedReceiver<MuxFrame>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            maybe = ctrl_rx.recv() => match maybe {
                Some(frame) => frame,
                None => break,
            },
            res = data_rx.recv() => match res {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        if sink.feed(frame).await.is_err() {
            shutdown.cancel();
            break;
        }
        // Batch whatever queued up while we were writing.
        while let Ok(frame) = ctrl_rx.try_recv() {
            if sink.feed(frame).await.is_err() {
                shutdown.cancel();
                return;
            }
        }
        while let Ok(Some(frame)) = data_rx.try_recv() {
            if sink.feed(frame).await.is_err() {
                shutdown.cancel();
                return;
            }
        }
        if sink.flush().await.is_err() {
            shutdown.cancel();
            break;
        }
    }

    // Best-effort farewell (GoAway queued by close()).
    while let Ok(frame) = ctrl_rx.try_recv() {
        if sink.feed(frame).await.is_err() {
            return;
        }
    }
    let _ = sink.flush().await;
}

/// Read loop: single reader of the transport; fatal errors close the session.
async fn run_reader(mut source: MuxStream, mux: Multiplexer) {
    let shutdown = mux.closed_token();
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if let Err(e) = mux.process_frame(frame).await {
                    warn!(error = %e, "protocol violation, closing session");
                    break;
                }
            }
            Some(Err(e)) => {
                debug!(error = %e, "transport read error");
                break;
            }
            None => {
                debug!("transport closed by peer");
                break;
            }
        }
    }
    mux.close();
}

/// Keepalive probe: ping on an interval, kill the session when a probe goes
/// unanswered past the dead threshold.
async fn run_keepalive(mux: Multiplexer, config: KeepaliveConfig) {
    let shutdown = mux.closed_token();
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        match tokio::time::timeout(config.dead_after, mux.ping()).await {
            Ok(Ok(rtt)) => debug!(rtt_ms = rtt.as_millis() as u64, "keepalive pong"),
            Ok(Err(_)) => return,
            Err(_) => {
                warn!("keepalive timed out, closing session");
                mux.close();
                return;
            }
        }
    }
}

/// A running multiplexed session: the multiplexer plus its I/O tasks.
#[derive(Clone)]
pub struct MuxSession {
    mux: Multiplexer,
    accept_rx: kanal::AsyncReceiver<VirtualStream>,
}

impl MuxSession {
    /// Frame the transport and spawn the writer, reader and keepalive tasks.
    pub fn spawn(io: BoxedStream, role: SessionRole, keepalive: KeepaliveConfig) -> Self {
        let framed = Framed::new(io, MuxCodec::new());
        let (sink, source) = framed.split();
        let (mux, handles) = Multiplexer::new(role);

        tokio::spawn(run_writer(
            sink,
            handles.data_rx,
            handles.ctrl_rx,
            mux.closed_token(),
        ));
        tokio::spawn(run_reader(source, mux.clone()));
        tokio::spawn(run_keepalive(mux.clone(), keepalive));

        Self {
            mux,
            accept_rx: handles.accept_rx,
        }
    }

    pub fn multiplexer(&self) -> Multiplexer {
        self.mux.clone()
    }

    /// Take the control stream. Yields once per session.
    pub fn take_control_stream(&self) -> Option<VirtualStream> {
        self.mux.take_control_stream()
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<VirtualStream> {
        self.accept_rx
            .recv()
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }

    pub async fn open_stream(&self) -> Result<VirtualStream> {
        self.mux.open_stream().await
    }

    pub async fn ping(&self) -> Result<Duration> {
        self.mux.ping().await
    }

    pub fn close(&self) {
        self.mux.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mux.is_closed()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.mux.closed_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::spawn(Box::pin(a), SessionRole::Client, KeepaliveConfig::default());
        let server = MuxSession::spawn(Box::pin(b), SessionRole::Server, KeepaliveConfig::default());
        (client, server)
    }

    #[tokio::test]
    async fn test_open_accept_and_echo() {
        let (client, server) = pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"hello over the mux").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inbound = server.accept_stream().await.unwrap();
        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello over the mux");

        // Reply on the same stream before the reverse direction closes.
        inbound.write_all(b"ack").await.unwrap();
        inbound.shutdown().await.unwrap();

        let mut reply = Vec::new();
        out.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ack");
    }

    #[tokio::test]
    async fn test_stream_id_parity() {
        let (client, server) = pair();

        let s1 = client.open_stream().await.unwrap();
        let s2 = client.open_stream().await.unwrap();
        assert_eq!(s1.id(), 1);
        assert_eq!(s2.id(), 3);

        let s3 = server.open_stream().await.unwrap();
        assert_eq!(s3.id(), 2);
    }

    #[tokio::test]
    async fn test_control_stream_round_trip() {
        let (client, server) = pair();

        let mut c_ctrl = client.take_control_stream().unwrap();
        let mut s_ctrl = server.take_control_stream().unwrap();
        assert!(client.take_control_stream().is_none());

        c_ctrl.write_all(b"ping!").await.unwrap();
        let mut buf = [0u8; 5];
        s_ctrl.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping!");
    }

    #[tokio::test]
    async fn test_ping_rtt() {
        let (client, _server) = pair();
        let rtt = client.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_large_transfer_respects_flow_control() {
        let (client, server) = pair();

        // 4 MiB: many times the 256 KiB window, so progress proves credit
        // is being returned.
        let payload = vec![0xA5u8; 4 * 1024 * 1024];
        let expected = payload.clone();

        let mut out = client.open_stream().await.unwrap();
        let writer = tokio::spawn(async move {
            out.write_all(&payload).await.unwrap();
            out.shutdown().await.unwrap();
        });

        let mut inbound = server.accept_stream().await.unwrap();
        let mut got = Vec::new();
        inbound.read_to_end(&mut got).await.unwrap();
        writer.await.unwrap();

        assert_eq!(got.len(), expected.len());
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_close_unblocks_everything() {
        let (client, server) = pair();

        let mut stream = client.open_stream().await.unwrap();
        let _accepted = server.accept_stream().await.unwrap();

        client.close();

        let mut buf = [0u8; 8];
        assert!(stream.read(&mut buf).await.is_err());
        assert!(client.open_stream().await.is_err());
        assert!(client.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_closing_one_stream_leaves_others_alone() {
        let (client, server) = pair();

        let mut a = client.open_stream().await.unwrap();
        let mut b = client.open_stream().await.unwrap();
        let mut sa = server.accept_stream().await.unwrap();
        let mut sb = server.accept_stream().await.unwrap();

        a.write_all(b"first").await.unwrap();
        b.write_all(b"second").await.unwrap();
        a.shutdown().await.unwrap();

        let mut buf = [0u8; 5];
        sa.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        // Fully close `a`; `b` must keep flowing.
        drop(a);
        drop(sa);

        let mut buf = [0u8; 6];
        sb.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");

        sb.write_all(b"still alive").await.unwrap();
        let mut buf = [0u8; 11];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still alive");
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let (client, server) = pair();

        let _quiet = client.open_stream().await.unwrap();
        let mut inbound = server.accept_stream().await.unwrap();
        inbound.set_read_timeout(Some(Duration::from_millis(50)));

        let mut buf = [0u8; 8];
        let err = inbound.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
