//! UDP tunnels: datagram delivery over the shared stream and per-source
//! reply isolation.

use super::*;

#[tokio::test]
async fn udp_tunnel_two_senders_stay_isolated() {
    let server = start_server(33_000..=33_004, 33_005..=33_009).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_udp_echo(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::udp(0, local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    let Endpoint::Udp { port } = registered[0].1 else {
        panic!("expected udp endpoint");
    };
    assert!((33_005..=33_009).contains(&port));

    // Two public senders from distinct source ports.
    let sender_a = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let sender_b = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    sender_a.connect((LOCALHOST, port)).await.unwrap();
    sender_b.connect((LOCALHOST, port)).await.unwrap();

    // Retry sends: the first datagram may race bridge setup.
    let mut got_a = None;
    let mut got_b = None;
    let mut buf = [0u8; 64];
    for _ in 0..50 {
        if got_a.is_none() {
            sender_a.send(b"a").await.unwrap();
        }
        if got_b.is_none() {
            sender_b.send(b"b").await.unwrap();
        }

        if got_a.is_none() {
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(200), sender_a.recv(&mut buf)).await
            {
                got_a = Some(buf[..n].to_vec());
            }
        }
        if got_b.is_none() {
            if let Ok(Ok(n)) =
                tokio::time::timeout(Duration::from_millis(200), sender_b.recv(&mut buf)).await
            {
                got_b = Some(buf[..n].to_vec());
            }
        }
        if got_a.is_some() && got_b.is_some() {
            break;
        }
    }

    // Each sender sees exactly its own payload echoed back.
    assert_eq!(got_a.as_deref(), Some(b"a".as_slice()));
    assert_eq!(got_b.as_deref(), Some(b"b".as_slice()));
}

#[tokio::test]
async fn udp_large_datagram_round_trips() {
    let server = start_server(33_010..=33_014, 33_015..=33_019).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_udp_echo(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::udp(0, local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    let Endpoint::Udp { port } = registered[0].1 else {
        panic!("expected udp endpoint");
    };

    let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    sender.connect((LOCALHOST, port)).await.unwrap();

    // Comfortably below typical loopback MTU limits but well above any
    // accidental small-buffer path.
    let payload = vec![0x42u8; 8 * 1024];
    let mut buf = vec![0u8; 16 * 1024];
    let mut got = None;
    for _ in 0..50 {
        sender.send(&payload).await.unwrap();
        if let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(200), sender.recv(&mut buf)).await
        {
            got = Some(buf[..n].to_vec());
            break;
        }
    }
    assert_eq!(got.as_deref(), Some(payload.as_slice()));
}
