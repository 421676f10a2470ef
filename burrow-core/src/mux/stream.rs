//! Virtual streams
//!
//! A [`VirtualStream`] is one bidirectional byte channel inside a session.
//! Reads drain a per-stream inbox fed by the session read loop; writes chop
//! the buffer into frames, acquiring flow-control credit first. The polling
//! bridge uses boxed pending futures to marry the async channel API with
//! tokio's poll-based traits.

use super::{MuxInner, StreamEntry};
use burrow_protocol::constants::{INITIAL_STREAM_WINDOW, MAX_DATA_CHUNK};
use burrow_protocol::frame::MuxFrame;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;

/// Events delivered to a stream's inbox by the session read loop.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Fin,
    Reset,
}

/// Send-direction flow-control credit.
///
/// `acquire` grants up to `max` bytes once any credit is available; partial
/// grants are normal near window exhaustion.
pub(crate) struct SendWindow {
    avail: AtomicI64,
    notify: Notify,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            avail: AtomicI64::new(i64::from(initial)),
            notify: Notify::new(),
        }
    }

    pub(crate) async fn acquire(&self, max: usize) -> usize {
        loop {
            let cur = self.avail.load(Ordering::Acquire);
            if cur > 0 {
                let take = cur.min(max as i64);
                if self
                    .avail
                    .compare_exchange(cur, cur - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return take as usize;
                }
                continue;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn add(&self, n: u32) {
        self.avail.fetch_add(i64::from(n), Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

/// State shared between a [`VirtualStream`] and the multiplexer.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) send_window: SendWindow,
    /// Bytes the peer may still send before we return credit.
    pub(crate) recv_budget: AtomicI64,
    /// Bytes consumed locally since the last `WindowUpdate`.
    consumed: AtomicU32,
    pub(crate) ctrl_tx: mpsc::UnboundedSender<MuxFrame>,
    pub(crate) data_tx: kanal::AsyncSender<MuxFrame>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) streams: Arc<DashMap<u32, StreamEntry>>,
    pub(crate) local_fin: AtomicBool,
    pub(crate) remote_fin: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new(id: u32, inner: &MuxInner) -> Self {
        Self {
            id,
            send_window: SendWindow::new(INITIAL_STREAM_WINDOW),
            recv_budget: AtomicI64::new(i64::from(INITIAL_STREAM_WINDOW)),
            consumed: AtomicU32::new(0),
            ctrl_tx: inner.ctrl_tx.clone(),
            data_tx: inner.data_tx.clone(),
            shutdown: inner.shutdown.clone(),
            streams: Arc::clone(&inner.streams),
            local_fin: AtomicBool::new(false),
            remote_fin: AtomicBool::new(false),
        }
    }

    /// Account locally consumed bytes; return credit to the peer once half a
    /// window has been drained.
    fn note_consumed(&self, n: usize) {
        let total = self.consumed.fetch_add(n as u32, Ordering::AcqRel) + n as u32;
        if total >= INITIAL_STREAM_WINDOW / 2 {
            let delta = self.consumed.swap(0, Ordering::AcqRel);
            if delta > 0 {
                self.recv_budget.fetch_add(i64::from(delta), Ordering::AcqRel);
                let _ = self.ctrl_tx.send(MuxFrame::WindowUpdate {
                    stream_id: self.id,
                    delta,
                });
            }
        }
    }

    /// Drop the registry entry once both directions are done.
    pub(crate) fn maybe_remove(&self) {
        if self.local_fin.load(Ordering::Acquire) && self.remote_fin.load(Ordering::Acquire) {
            self.streams.remove(&self.id);
        }
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "session closed")
}

async fn send_chunk(shared: Arc<StreamShared>, chunk: Bytes) -> io::Result<usize> {
    let granted = tokio::select! {
        _ = shared.shutdown.cancelled() => return Err(broken_pipe()),
        granted = shared.send_window.acquire(chunk.len()) => granted,
    };
    let data = chunk.slice(..granted);
    shared
        .data_tx
        .send(MuxFrame::Data {
            stream_id: shared.id,
            data,
            fin: false,
        })
        .await
        .map_err(|_| broken_pipe())?;
    Ok(granted)
}

async fn send_fin(shared: Arc<StreamShared>) -> io::Result<()> {
    shared
        .data_tx
        .send(MuxFrame::Data {
            stream_id: shared.id,
            data: Bytes::new(),
            fin: true,
        })
        .await
        .map_err(|_| broken_pipe())?;
    shared.local_fin.store(true, Ordering::Release);
    shared.maybe_remove();
    Ok(())
}

type PendingWrite = Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send>>;
type PendingShutdown = Pin<Box<dyn std::future::Future<Output = io::Result<()>> + Send>>;

/// A bidirectional byte channel inside a session.
///
/// Implements `AsyncRead` + `AsyncWrite`. `shutdown()` half-closes the send
/// direction; dropping without a clean close resets the stream.
pub struct VirtualStream {
    shared: Arc<StreamShared>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    read_buf: BytesMut,
    read_eof: bool,
    reset: bool,
    write_fin_sent: bool,
    pending_write: Option<PendingWrite>,
    pending_shutdown: Option<PendingShutdown>,
    read_timeout: Option<Duration>,
    read_deadline: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("stream_id", &self.shared.id)
            .field("read_buf_len", &self.read_buf.len())
            .field("read_eof", &self.read_eof)
            .finish_non_exhaustive()
    }
}

impl VirtualStream {
    pub(crate) fn new(shared: Arc<StreamShared>, rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            shared,
            rx,
            read_buf: BytesMut::new(),
            read_eof: false,
            reset: false,
            write_fin_sent: false,
            pending_write: None,
            pending_shutdown: None,
            read_timeout: None,
            read_deadline: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// True once the owning session has died; reads and writes will fail.
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Idle deadline for reads: a read that sees no bytes for this long
    /// fails with `TimedOut`. `None` disables the deadline.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
        self.read_deadline = None;
    }

    fn arm_deadline(&mut self) {
        if let Some(t) = self.read_timeout {
            self.read_deadline = Some(Box::pin(tokio::time::sleep(t)));
        }
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Drain buffered bytes first.
        if !self.read_buf.is_empty() {
            let len = std::cmp::min(buf.remaining(), self.read_buf.len());
            buf.put_slice(&self.read_buf.split_to(len));
            return Poll::Ready(Ok(()));
        }
        if self.reset {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "stream reset by peer",
            )));
        }
        if self.read_eof {
            return Poll::Ready(Ok(())); // EOF
        }

        if self.read_timeout.is_some() && self.read_deadline.is_none() {
            self.arm_deadline();
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Data(bytes))) => {
                self.shared.note_consumed(bytes.len());
                let len = std::cmp::min(buf.remaining(), bytes.len());
                buf.put_slice(&bytes[..len]);
                if len < bytes.len() {
                    self.read_buf.extend_from_slice(&bytes[len..]);
                }
                if self.read_timeout.is_some() {
                    self.arm_deadline();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(StreamEvent::Fin)) => {
                self.read_eof = true;
                Poll::Ready(Ok(())) // EOF
            }
            Poll::Ready(Some(StreamEvent::Reset)) => {
                self.reset = true;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "stream reset",
                )))
            }
            Poll::Ready(None) => Poll::Ready(Err(broken_pipe())),
            Poll::Pending => {
                if let Some(deadline) = self.read_deadline.as_mut() {
                    if deadline.as_mut().poll(cx).is_ready() {
                        self.read_deadline = None;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "stream read deadline elapsed",
                        )));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_fin_sent {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if self.pending_write.is_none() {
            let chunk = Bytes::copy_from_slice(&buf[..std::cmp::min(buf.len(), MAX_DATA_CHUNK)]);
            let shared = Arc::clone(&self.shared);
            self.pending_write = Some(Box::pin(send_chunk(shared, chunk)));
        }

        // Just set above when absent, so the unwrap cannot fire.
        #[allow(clippy::unwrap_used)]
        let fut = self.pending_write.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.pending_write = None;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the writer task on poll_write completion;
        // there is nothing extra to flush at this layer.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_fin_sent {
            return Poll::Ready(Ok(()));
        }

        // Let an in-flight chunk finish so FIN stays ordered after it.
        if let Some(fut) = self.pending_write.as_mut() {
            match fut.as_mut().poll(cx) {
                Poll::Ready(_) => self.pending_write = None,
                Poll::Pending => return Poll::Pending,
            }
        }

        if self.pending_shutdown.is_none() {
            let shared = Arc::clone(&self.shared);
            self.pending_shutdown = Some(Box::pin(send_fin(shared)));
        }

        // Just set above when absent, so the unwrap cannot fire.
        #[allow(clippy::unwrap_used)]
        let fut = self.pending_shutdown.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                self.pending_shutdown = None;
                if result.is_ok() {
                    self.write_fin_sent = true;
                }
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        let clean = self.write_fin_sent && (self.read_eof || self.reset);
        if !clean && !self.shared.shutdown.is_cancelled() {
            let _ = self.shared.ctrl_tx.send(MuxFrame::ResetStream {
                stream_id: self.shared.id,
            });
        }
        self.shared.streams.remove(&self.shared.id);
    }
}
