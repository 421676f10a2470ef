//! Session loss and reconnection: tunnels replay with the same public
//! descriptors.

use super::*;

#[tokio::test]
async fn reconnect_replays_tunnels() {
    let server = start_server(34_000..=34_004, 34_005..=34_009).await;

    // The client dials through a proxy the test can sever.
    let proxy = FlakyProxy::start(server.control_addr).await;

    let local_http = SocketAddr::new(LOCALHOST, free_port().await);
    let local_tcp = SocketAddr::new(LOCALHOST, free_port().await);
    start_http_echo_head(local_http).await;
    start_tcp_upper(local_tcp).await;

    let (_manager, mut events) = start_client(
        proxy.addr.to_string(),
        vec![
            TunnelIntent::http("replayed", local_http.to_string()),
            TunnelIntent::tcp(0, local_tcp.to_string()),
        ],
    );

    let first = wait_registered(&mut events, 2).await;
    let Endpoint::Http { fqdn: fqdn_before } = &first[0].1 else {
        panic!("expected http endpoint first");
    };
    let Endpoint::Tcp { port: port_before } = first[1].1 else {
        panic!("expected tcp endpoint second");
    };

    // Kill the transport under the live session.
    proxy.sever_all().await;

    // Wait for the disconnect notice, then for both tunnels to come back.
    let disconnected = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event channel closed") {
                TunnelEvent::Disconnected => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(disconnected.is_ok(), "no disconnect event");

    let second = wait_registered(&mut events, 2).await;
    let Endpoint::Http { fqdn: fqdn_after } = &second[0].1 else {
        panic!("expected http endpoint first");
    };
    let Endpoint::Tcp { port: port_after } = second[1].1 else {
        panic!("expected tcp endpoint second");
    };

    // Same public descriptors, fresh tunnel ids.
    assert_eq!(fqdn_before, fqdn_after);
    assert_eq!(port_before, port_after);
    assert_ne!(first[0].0, second[0].0);
    assert_ne!(first[1].0, second[1].0);

    // And the replayed tunnels actually carry traffic.
    let (status, body) = http_get(server.http_addr, fqdn_after, "/ping").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("pong"));

    let mut public = TcpStream::connect((LOCALHOST, port_after)).await.unwrap();
    public.write_all(b"again").await.unwrap();
    let mut reply = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(10), public.read_exact(&mut reply))
        .await
        .expect("no echo after reconnect")
        .unwrap();
    assert_eq!(&reply, b"AGAIN");
}

#[tokio::test]
async fn manager_close_stops_reconnecting() {
    let server = start_server(34_010..=34_014, 34_015..=34_019).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_http_echo_head(local_addr).await;

    let (manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("closing", local_addr.to_string())],
    );
    wait_registered(&mut events, 1).await;

    manager.close();

    // The reservation is released once the session is gone; a new client
    // can claim the same name.
    let claimed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let (probe, mut probe_events) = start_client(
                server.control_addr.to_string(),
                vec![TunnelIntent::http("closing", local_addr.to_string())],
            );
            let event = probe_events.recv().await.expect("event channel closed");
            match event {
                TunnelEvent::Connected { .. } => {
                    let next = probe_events.recv().await.expect("event channel closed");
                    probe.close();
                    if matches!(next, TunnelEvent::Registered { .. }) {
                        break;
                    }
                }
                TunnelEvent::Registered { .. } => {
                    probe.close();
                    break;
                }
                _ => probe.close(),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(claimed.is_ok(), "reservation was never released");
}
