//! Raw TCP tunnels on leased ports.

use super::*;

#[tokio::test]
async fn tcp_tunnel_on_leased_port() {
    let server = start_server(32_000..=32_004, 32_005..=32_009).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_tcp_upper(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::tcp(0, local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    let Endpoint::Tcp { port } = registered[0].1 else {
        panic!("expected tcp endpoint");
    };
    assert!((32_000..=32_004).contains(&port));

    let mut public = TcpStream::connect((LOCALHOST, port)).await.unwrap();
    public.write_all(b"hello").await.unwrap();

    let mut reply = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(10), public.read_exact(&mut reply))
        .await
        .expect("no echo arrived")
        .unwrap();
    assert_eq!(&reply, b"HELLO");
}

#[tokio::test]
async fn tcp_port_hint_is_honored() {
    let server = start_server(32_010..=32_014, 32_015..=32_019).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_tcp_upper(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::tcp(32_012, local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    assert_eq!(registered[0].1, Endpoint::Tcp { port: 32_012 });
}

#[tokio::test]
async fn tcp_large_payload_round_trips() {
    let server = start_server(32_020..=32_024, 32_025..=32_029).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_tcp_upper(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::tcp(0, local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    let Endpoint::Tcp { port } = registered[0].1 else {
        panic!("expected tcp endpoint");
    };

    // Multiple flow-control windows worth of data in each direction.
    let payload = vec![b'x'; 2 * 1024 * 1024];
    let public = TcpStream::connect((LOCALHOST, port)).await.unwrap();

    let (mut read_half, mut write_half) = public.into_split();
    let expected_len = payload.len();
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload).await.unwrap();
        write_half.shutdown().await.unwrap();
    });

    let mut received = Vec::with_capacity(expected_len);
    let mut buf = vec![0u8; 64 * 1024];
    while received.len() < expected_len {
        let n = tokio::time::timeout(Duration::from_secs(30), read_half.read(&mut buf))
            .await
            .expect("transfer stalled")
            .unwrap();
        assert!(n > 0, "connection closed early at {} bytes", received.len());
        received.extend_from_slice(&buf[..n]);
    }
    writer.await.unwrap();

    assert_eq!(received.len(), expected_len);
    assert!(received.iter().all(|&b| b == b'X'));
}
