//! Control channel
//!
//! Wraps stream 0 of a session with the control codec and the
//! request/response plumbing: one read task routes responses to a
//! correlation-ID-indexed map of one-shot waiters and forwards everything
//! else (requests, notifications) to the channel owner. Session close fails
//! every pending waiter at once.

use crate::mux::VirtualStream;
use burrow_common::{Result, TunnelError};
use burrow_protocol::codec::ControlCodec;
use burrow_protocol::message::Message;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ControlSink = SplitSink<Framed<VirtualStream, ControlCodec>, Message>;
type ControlSource = SplitStream<Framed<VirtualStream, ControlCodec>>;

/// One side's handle on the control stream.
pub struct ControlChannel {
    sink: Mutex<ControlSink>,
    waiters: Arc<DashMap<u64, oneshot::Sender<Message>>>,
    next_id: AtomicU64,
    request_timeout: Duration,
    session: CancellationToken,
}

impl ControlChannel {
    /// Wrap the control stream. Returns the channel and the inbox of
    /// messages that are not responses to local requests.
    ///
    /// `session` must be the owning session's close token: a control-stream
    /// failure is fatal, so the read task cancels it on the way out.
    pub fn new(
        stream: VirtualStream,
        request_timeout: Duration,
        session: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let framed = Framed::new(stream, ControlCodec::new());
        let (sink, source) = framed.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let waiters: Arc<DashMap<u64, oneshot::Sender<Message>>> = Arc::new(DashMap::new());

        let channel = Arc::new(Self {
            sink: Mutex::new(sink),
            waiters: Arc::clone(&waiters),
            next_id: AtomicU64::new(1),
            request_timeout,
            session: session.clone(),
        });

        tokio::spawn(read_loop(source, waiters, inbound_tx, session));

        (channel, inbound_rx)
    }

    /// Send a request and wait for the response that echoes its id.
    ///
    /// The closure receives the allocated correlation id and builds the
    /// message around it.
    pub async fn request(&self, build: impl FnOnce(u64) -> Message) -> Result<Message> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);

        if let Err(e) = self.send(build(id)).await {
            self.waiters.remove(&id);
            return Err(e);
        }

        tokio::select! {
            _ = self.session.cancelled() => {
                self.waiters.remove(&id);
                Err(TunnelError::SessionClosed)
            }
            res = tokio::time::timeout(self.request_timeout, rx) => match res {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(_)) => Err(TunnelError::SessionClosed),
                Err(_) => {
                    self.waiters.remove(&id);
                    Err(TunnelError::Timeout("control request".to_string()))
                }
            },
        }
    }

    /// Send a message without waiting: responses (the id is already baked
    /// in) and notifications.
    pub async fn send(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(message)
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }
}

async fn read_loop(
    mut source: ControlSource,
    waiters: Arc<DashMap<u64, oneshot::Sender<Message>>>,
    inbound_tx: mpsc::Sender<Message>,
    session: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = session.cancelled() => break,
            next = source.next() => next,
        };
        match next {
            Some(Ok(message)) => {
                if message.is_response() {
                    if let Some((_, waiter)) = waiters.remove(&message.id()) {
                        let _ = waiter.send(message);
                    } else {
                        debug!(id = message.id(), "response with no waiter");
                    }
                } else if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "control stream error");
                break;
            }
            None => {
                debug!("control stream closed");
                break;
            }
        }
    }

    // Fail every pending waiter at once, then take the session down: a dead
    // control stream means a dead session.
    waiters.clear();
    session.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{KeepaliveConfig, MuxSession, SessionRole};
    use burrow_protocol::message::Quotas;
    use uuid::Uuid;

    fn session_pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = MuxSession::spawn(Box::pin(a), SessionRole::Client, KeepaliveConfig::default());
        let server = MuxSession::spawn(Box::pin(b), SessionRole::Server, KeepaliveConfig::default());
        (client, server)
    }

    #[tokio::test]
    async fn test_request_response() {
        let (client, server) = session_pair();

        let (client_ch, _client_inbox) = ControlChannel::new(
            client.take_control_stream().unwrap(),
            Duration::from_secs(5),
            client.closed_token(),
        );
        let (server_ch, mut server_inbox) = ControlChannel::new(
            server.take_control_stream().unwrap(),
            Duration::from_secs(5),
            server.closed_token(),
        );

        // Server: answer one Authenticate with AuthOk.
        let client_id = Uuid::new_v4();
        let responder = tokio::spawn(async move {
            let msg = server_inbox.recv().await.unwrap();
            let Message::Authenticate { id, token, .. } = msg else {
                panic!("expected Authenticate");
            };
            assert_eq!(token, "secret");
            server_ch
                .send(Message::AuthOk {
                    id,
                    client_id,
                    quotas: Quotas::default(),
                })
                .await
                .unwrap();
        });

        let reply = client_ch
            .request(|id| Message::Authenticate {
                id,
                token: "secret".to_string(),
                attach_to: None,
            })
            .await
            .unwrap();
        responder.await.unwrap();

        match reply {
            Message::AuthOk { client_id: got, .. } => assert_eq!(got, client_id),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let (client, server) = session_pair();

        let (client_ch, _inbox) = ControlChannel::new(
            client.take_control_stream().unwrap(),
            Duration::from_millis(50),
            client.closed_token(),
        );
        // Server never reads or replies.
        let _unused = server.take_control_stream().unwrap();

        let err = client_ch
            .request(|id| Message::Ping { id })
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_session_close_fails_waiters() {
        let (client, server) = session_pair();

        let (client_ch, _inbox) = ControlChannel::new(
            client.take_control_stream().unwrap(),
            Duration::from_secs(30),
            client.closed_token(),
        );
        let _server_side = server.take_control_stream().unwrap();

        let pending = tokio::spawn(async move {
            client_ch.request(|id| Message::Ping { id }).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, TunnelError::SessionClosed));
    }

    #[tokio::test]
    async fn test_concurrent_requests_correlate() {
        let (client, server) = session_pair();

        let (client_ch, _client_inbox) = ControlChannel::new(
            client.take_control_stream().unwrap(),
            Duration::from_secs(5),
            client.closed_token(),
        );
        let (server_ch, mut server_inbox) = ControlChannel::new(
            server.take_control_stream().unwrap(),
            Duration::from_secs(5),
            server.closed_token(),
        );

        // Reply to pings out of order: buffer two, answer second first.
        let responder = tokio::spawn(async move {
            let first = server_inbox.recv().await.unwrap();
            let second = server_inbox.recv().await.unwrap();
            server_ch.send(Message::Pong { id: second.id() }).await.unwrap();
            server_ch.send(Message::Pong { id: first.id() }).await.unwrap();
        });

        let a = {
            let ch = Arc::clone(&client_ch);
            tokio::spawn(async move { ch.request(|id| Message::Ping { id }).await })
        };
        let b = {
            let ch = Arc::clone(&client_ch);
            tokio::spawn(async move { ch.request(|id| Message::Ping { id }).await })
        };

        let ra = a.await.unwrap().unwrap();
        let rb = b.await.unwrap().unwrap();
        responder.await.unwrap();

        assert!(matches!(ra, Message::Pong { .. }));
        assert!(matches!(rb, Message::Pong { .. }));
    }
}
