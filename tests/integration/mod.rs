//! End-to-end integration tests
//!
//! Each test runs a real server and client in-process and pushes traffic
//! through actual sockets on 127.0.0.1.

mod http_test;
mod reconnect_test;
mod tcp_test;
mod udp_test;

use burrow_client::{SessionManager, TunnelEvent, TunnelIntent};
use burrow_common::config::{ClientConfig, ServerConfig};
use burrow_protocol::message::Endpoint;
use burrow_server::{StaticTokenValidator, TunnelServer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};

pub const TEST_TOKEN: &str = "test-token";
pub const BASE_DOMAIN: &str = "example.test";

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Grab a free localhost port. Racy by nature; good enough for tests.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

pub struct TestServer {
    pub control_addr: SocketAddr,
    pub http_addr: SocketAddr,
}

/// Start a server with per-test lease ranges (tests run concurrently; the
/// ranges must not overlap between tests).
pub async fn start_server(
    tcp_range: RangeInclusive<u16>,
    udp_range: RangeInclusive<u16>,
) -> TestServer {
    let control_addr = SocketAddr::new(LOCALHOST, free_port().await);
    let http_addr = SocketAddr::new(LOCALHOST, free_port().await);

    let config = ServerConfig {
        control_addr,
        http_addr,
        https_addr: None,
        ingress_ip: LOCALHOST,
        base_domain: BASE_DOMAIN.to_string(),
        tcp_port_range: tcp_range,
        udp_port_range: udp_range,
        udp_nat_idle: Duration::from_secs(60),
        ..ServerConfig::default()
    };

    let server = TunnelServer::new(config).with_token_validator(Arc::new(
        StaticTokenValidator::single(TEST_TOKEN, "tester"),
    ));
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    wait_for_listener(control_addr).await;
    wait_for_listener(http_addr).await;

    TestServer {
        control_addr,
        http_addr,
    }
}

pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("listener {addr} did not come up");
}

/// Start a client manager with fast reconnect timings for tests.
pub fn start_client(
    server_addr: String,
    intents: Vec<TunnelIntent>,
) -> (Arc<SessionManager>, mpsc::Receiver<TunnelEvent>) {
    let config = ClientConfig {
        server_addr,
        token: TEST_TOKEN.to_string(),
        stream_pool_size: 8,
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_millis(400),
        ..ClientConfig::default()
    };
    let (manager, events) = SessionManager::new(config);
    for intent in intents {
        manager.add_tunnel(intent);
    }
    let runner = Arc::clone(&manager);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (manager, events)
}

/// Drain events until `n` registrations arrived; panics on RegisterFailed.
pub async fn wait_registered(
    events: &mut mpsc::Receiver<TunnelEvent>,
    n: usize,
) -> Vec<(u64, Endpoint)> {
    let mut registered = Vec::new();
    let deadline = Duration::from_secs(10);
    while registered.len() < n {
        let event = tokio::time::timeout(deadline, events.recv())
            .await
            .expect("timed out waiting for registration")
            .expect("event channel closed");
        match event {
            TunnelEvent::Registered {
                tunnel_id,
                endpoint,
                ..
            } => registered.push((tunnel_id, endpoint)),
            TunnelEvent::RegisterFailed { spec, reason } => {
                panic!("registration failed for {spec:?}: {reason}");
            }
            _ => {}
        }
    }
    registered
}

/// Minimal local HTTP service: answers every request with 200 and a body
/// that embeds the request head, so tests can assert forwarded headers.
pub async fn start_http_echo_head(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match sock.read(&mut byte).await {
                        Ok(1) => head.push(byte[0]),
                        _ => return,
                    }
                }
                let body = format!("pong\n{}", String::from_utf8_lossy(&head));
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(response.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
}

/// Local TCP service uppercasing everything it receives.
pub async fn start_tcp_upper(addr: SocketAddr) {
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let upper: Vec<u8> =
                                buf[..n].iter().map(u8::to_ascii_uppercase).collect();
                            if sock.write_all(&upper).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
}

/// Local UDP service echoing every datagram back to its sender.
pub async fn start_udp_echo(addr: SocketAddr) {
    let socket = UdpSocket::bind(addr).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
}

/// Raw HTTP/1.1 GET against the shared ingress, routing by Host header.
/// Returns (status_code, body).
pub async fn http_get(ingress: SocketAddr, host: &str, path: &str) -> (u16, String) {
    let mut sock = TcpStream::connect(ingress).await.unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    sock.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), sock.read_to_end(&mut raw))
        .await
        .expect("response timed out")
        .unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

/// TCP proxy that can sever every in-flight connection: lets tests kill the
/// transport under a live session without reaching into either endpoint.
pub struct FlakyProxy {
    pub addr: SocketAddr,
    links: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl FlakyProxy {
    pub async fn start(target: SocketAddr) -> Self {
        let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let links: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>> =
            Arc::new(Mutex::new(Vec::new()));

        let accept_links = Arc::clone(&links);
        tokio::spawn(async move {
            loop {
                let Ok((mut inbound, _)) = listener.accept().await else {
                    return;
                };
                let handle = tokio::spawn(async move {
                    let Ok(mut outbound) = TcpStream::connect(target).await else {
                        return;
                    };
                    let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                });
                accept_links.lock().await.push(handle);
            }
        });

        Self { addr, links }
    }

    /// Drop every forwarded connection; both endpoints see the transport
    /// fail.
    pub async fn sever_all(&self) {
        for handle in self.links.lock().await.drain(..) {
            handle.abort();
        }
    }
}
