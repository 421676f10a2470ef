//! HTTP ingress dispatcher
//!
//! One shared listener terminates public HTTP(S). Requests route by `Host`
//! to the active hostname reservation; a stream to the owning client is
//! acquired, the inline header written, and the request proxied over it
//! with streaming bodies. A 101 response upgrades both sides and splices
//! raw bytes (WebSocket and friends).

use crate::observer::ExchangeRecord;
use crate::server::ServerContext;
use burrow_protocol::header::{write_stream_header, StreamKind};
use burrow_protocol::validation::normalize_host;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::BoxBody as BoxBodyCombinator;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Instant, SystemTime};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

type BoxBody = BoxBodyCombinator<Bytes, hyper::Error>;

/// Accept loop for the plain-HTTP listener.
pub(crate) async fn run_http_ingress(ctx: Arc<ServerContext>, listener: TcpListener) {
    info!(addr = %ctx.config.http_addr, "http ingress listening");
    loop {
        let (sock, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "http accept error");
                continue;
            }
        };
        serve_connection(Arc::clone(&ctx), Box::pin(sock), remote_addr, "http");
    }
}

/// Accept loop for the HTTPS listener; certificate lookup is by SNI.
pub(crate) async fn run_https_ingress(
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
) {
    info!("https ingress listening");
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
    loop {
        let (sock, remote_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "https accept error");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            match acceptor.accept(sock).await {
                Ok(tls) => serve_connection(ctx, Box::pin(tls), remote_addr, "https"),
                Err(e) => debug!(peer = %remote_addr, error = %e, "tls handshake failed"),
            }
        });
    }
}

fn serve_connection(
    ctx: Arc<ServerContext>,
    io: burrow_core::transport::BoxedStream,
    remote_addr: SocketAddr,
    scheme: &'static str,
) {
    tokio::spawn(async move {
        let service = service_fn(move |req| {
            let ctx = Arc::clone(&ctx);
            async move { Ok::<_, Infallible>(handle_request(req, ctx, remote_addr, scheme).await) }
        });
        let conn = server_http1::Builder::new()
            .serve_connection(TokioIo::new(io), service)
            .with_upgrades();
        if let Err(e) = conn.await {
            debug!(peer = %remote_addr, error = %e, "http connection ended");
        }
    });
}

async fn handle_request(
    mut req: Request<hyper::body::Incoming>,
    ctx: Arc<ServerContext>,
    remote_addr: SocketAddr,
    scheme: &'static str,
) -> Response<BoxBody> {
    // 1. Route by hostname.
    let raw_host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string));
    let Some(raw_host) = raw_host else {
        return text_response(StatusCode::BAD_REQUEST, "missing host header");
    };
    let host = normalize_host(&raw_host);

    let Some(record) = ctx.registry.lookup_hostname(&host) else {
        return text_response(StatusCode::NOT_FOUND, "tunnel not found");
    };
    let Some(client) = ctx.clients.get(&record.client_id) else {
        return text_response(StatusCode::BAD_GATEWAY, "tunnel session unavailable");
    };

    // 2. Dedicate a stream to this request.
    let mut stream = match client.acquire_stream().await {
        Ok(s) => s,
        Err(e) => {
            debug!(tunnel_id = record.id, error = %e, "stream acquisition failed");
            return text_response(StatusCode::BAD_GATEWAY, "tunnel unavailable");
        }
    };
    if write_stream_header(
        &mut stream,
        StreamKind::Http,
        record.id,
        &remote_addr.to_string(),
    )
    .await
    .is_err()
    {
        return text_response(StatusCode::BAD_GATEWAY, "tunnel unavailable");
    }

    // 3. Forwarding metadata, upgrade bookkeeping, observer tee.
    inject_forwarding_headers(&mut req, remote_addr, scheme, &host);
    let upgrade_requested = req.headers().contains_key(header::UPGRADE);
    let downstream_upgrade = upgrade_requested.then(|| hyper::upgrade::on(&mut req));

    let started_at = SystemTime::now();
    let started = Instant::now();
    let capture = Arc::new(Mutex::new(ExchangeRecord {
        host: host.clone(),
        method: req.method().to_string(),
        uri: req.uri().to_string(),
        remote_addr: remote_addr.to_string(),
        request_headers: header_pairs(req.headers()),
        request_body: Vec::new(),
        status: 0,
        response_headers: Vec::new(),
        response_body: Vec::new(),
        started_at,
        duration: std::time::Duration::ZERO,
    }));
    let body_limit = ctx.observer.max_body_size;

    let (parts, body) = req.into_parts();
    let request_tee = {
        let capture = Arc::clone(&capture);
        let record = Arc::clone(&record);
        TeeBody::new(body, body_limit, move |captured, total| {
            record.stats.add_in(total);
            if let Ok(mut c) = capture.lock() {
                c.request_body = captured;
            }
        })
    };
    let forward_req = Request::from_parts(parts, request_tee);

    // 4. Speak HTTP/1 over the tunnel stream.
    let (mut sender, conn) =
        match hyper::client::conn::http1::handshake::<_, TeeBody<hyper::body::Incoming>>(
            TokioIo::new(stream),
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                debug!(tunnel_id = record.id, error = %e, "tunnel handshake failed");
                return text_response(StatusCode::BAD_GATEWAY, "local service unavailable");
            }
        };
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(error = %e, "tunnel http connection ended");
        }
    });

    // A closed-with-no-bytes stream (local dial refused) or a dead session
    // surfaces here as a send error; a wedged upstream trips the idle
    // deadline instead.
    let response = match tokio::time::timeout(
        ctx.config.http_stream_idle,
        sender.send_request(forward_req),
    )
    .await
    {
        Ok(Ok(res)) => res,
        Ok(Err(e)) => {
            debug!(tunnel_id = record.id, error = %e, "upstream request failed");
            return text_response(StatusCode::BAD_GATEWAY, "local service unavailable");
        }
        Err(_) => {
            return text_response(StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
        }
    };

    if let Ok(mut c) = capture.lock() {
        c.status = response.status().as_u16();
        c.response_headers = header_pairs(response.headers());
    }

    // 5. 101: splice both upgraded halves and hand the response back.
    if response.status() == StatusCode::SWITCHING_PROTOCOLS {
        let mut response = response;
        if let Some(downstream) = downstream_upgrade {
            let upstream = hyper::upgrade::on(&mut response);
            let record = Arc::clone(&record);
            tokio::spawn(async move {
                match tokio::try_join!(downstream, upstream) {
                    Ok((down, up)) => {
                        let mut down = TokioIo::new(down);
                        let mut up = TokioIo::new(up);
                        match tokio::io::copy_bidirectional(&mut down, &mut up).await {
                            Ok((to_up, to_down)) => {
                                record.stats.add_in(to_up);
                                record.stats.add_out(to_down);
                            }
                            Err(e) => debug!(error = %e, "upgraded splice ended"),
                        }
                    }
                    Err(e) => debug!(error = %e, "upgrade failed"),
                }
            });
        }
        return response.map(|b| b.boxed());
    }

    // 6. Stream the response back, teeing the head + bounded body copy to
    //    the observer. Never block forwarding on observation.
    let observer = ctx.observer.clone();
    let record_for_stats = Arc::clone(&record);
    response
        .map(move |body| {
            TeeBody::new(body, body_limit, move |captured, total| {
                record_for_stats.stats.add_out(total);
                if let Ok(mut c) = capture.lock() {
                    c.response_body = captured;
                    c.duration = started.elapsed();
                    observer.push(c.clone());
                }
            })
            .boxed()
        })
}

fn inject_forwarding_headers(
    req: &mut Request<hyper::body::Incoming>,
    remote_addr: SocketAddr,
    scheme: &str,
    host: &str,
) {
    let ip = remote_addr.ip().to_string();
    let headers = req.headers_mut();

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip.clone(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(scheme) {
        headers.insert("x-forwarded-proto", value);
    }
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert("x-forwarded-host", value);
    }
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert("x-real-ip", value);
    }
}

fn header_pairs(headers: &hyper::HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            )
        })
        .collect()
}

fn text_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    let bytes = Bytes::copy_from_slice(body.as_bytes());
    #[allow(clippy::unwrap_used)]
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(bytes).map_err(|never| match never {}).boxed())
        .unwrap()
}

type EndCallback = Box<dyn FnOnce(Vec<u8>, u64) + Send + Sync>;

/// Pass-through body that counts every byte and keeps a bounded prefix,
/// firing a callback at end of stream. Forwarding never waits on it.
struct TeeBody<B> {
    inner: B,
    captured: Vec<u8>,
    limit: usize,
    total: u64,
    on_end: Option<EndCallback>,
}

impl<B> TeeBody<B> {
    fn new(
        inner: B,
        limit: usize,
        on_end: impl FnOnce(Vec<u8>, u64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            limit,
            total: 0,
            on_end: Some(Box::new(on_end)),
        }
    }
}

impl<B> Body for TeeBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.total += data.len() as u64;
                    if this.captured.len() < this.limit {
                        let take = (this.limit - this.captured.len()).min(data.len());
                        this.captured.extend_from_slice(&data[..take]);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => {
                if let Some(cb) = this.on_end.take() {
                    cb(std::mem::take(&mut this.captured), this.total);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
