//! HTTP tunnel scenarios: host routing, forwarding headers, conflicts,
//! and gateway error mapping.

use super::*;
use burrow_protocol::message::RegisterFailReason;

#[tokio::test]
async fn http_tunnel_end_to_end() {
    let server = start_server(31_000..=31_004, 31_005..=31_009).await;

    // Local service behind the client.
    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_http_echo_head(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("myapp", local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    assert_eq!(
        registered[0].1,
        Endpoint::Http {
            fqdn: format!("myapp.{BASE_DOMAIN}")
        }
    );

    let (status, body) = http_get(server.http_addr, &format!("myapp.{BASE_DOMAIN}"), "/ping").await;
    assert_eq!(status, 200);
    assert!(body.starts_with("pong"), "unexpected body: {body}");

    // The local service saw the forwarding metadata with the public
    // client's IP.
    let lower = body.to_ascii_lowercase();
    assert!(lower.contains("x-forwarded-for: 127.0.0.1"), "head was: {body}");
    assert!(lower.contains("x-forwarded-proto: http"), "head was: {body}");
    assert!(lower.contains("x-real-ip: 127.0.0.1"), "head was: {body}");
}

#[tokio::test]
async fn unknown_hostname_is_404() {
    let server = start_server(31_010..=31_014, 31_015..=31_019).await;

    let (status, body) = http_get(server.http_addr, "nobody.example.test", "/").await;
    assert_eq!(status, 404);
    assert!(body.contains("tunnel not found"));
}

#[tokio::test]
async fn local_dial_failure_is_502() {
    let server = start_server(31_020..=31_024, 31_025..=31_029).await;

    // Nothing is bound at the local target.
    let dead_addr = SocketAddr::new(LOCALHOST, free_port().await);
    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("deadapp", dead_addr.to_string())],
    );
    wait_registered(&mut events, 1).await;

    let (status, _body) =
        http_get(server.http_addr, &format!("deadapp.{BASE_DOMAIN}"), "/").await;
    assert_eq!(status, 502);
}

#[tokio::test]
async fn subdomain_conflict_until_closed() {
    let server = start_server(31_030..=31_034, 31_035..=31_039).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_http_echo_head(local_addr).await;

    // First client claims "shared".
    let (first, mut first_events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("shared", local_addr.to_string())],
    );
    let registered = wait_registered(&mut first_events, 1).await;
    let (tunnel_id, _) = registered[0].clone();

    // Second client is refused.
    let (second, mut second_events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("shared", local_addr.to_string())],
    );
    let refused = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match second_events.recv().await.expect("event channel closed") {
                TunnelEvent::RegisterFailed { reason, .. } => break reason,
                _ => continue,
            }
        }
    })
    .await
    .expect("no rejection arrived");
    assert_eq!(refused, RegisterFailReason::SubdomainTaken);
    second.close();

    // First client releases the reservation; a fresh claim succeeds.
    first.close_tunnel(tunnel_id).await.unwrap();

    let (third, mut third_events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("shared", local_addr.to_string())],
    );
    let registered = wait_registered(&mut third_events, 1).await;
    assert_eq!(
        registered[0].1,
        Endpoint::Http {
            fqdn: format!("shared.{BASE_DOMAIN}")
        }
    );

    first.close();
    third.close();
}

#[tokio::test]
async fn random_subdomain_assigned_when_unspecified() {
    let server = start_server(31_040..=31_044, 31_045..=31_049).await;

    let local_addr = SocketAddr::new(LOCALHOST, free_port().await);
    start_http_echo_head(local_addr).await;

    let (_manager, mut events) = start_client(
        server.control_addr.to_string(),
        vec![TunnelIntent::http("", local_addr.to_string())],
    );
    let registered = wait_registered(&mut events, 1).await;
    let Endpoint::Http { fqdn } = &registered[0].1 else {
        panic!("expected http endpoint");
    };
    assert!(fqdn.ends_with(&format!(".{BASE_DOMAIN}")));
    let label = fqdn.strip_suffix(&format!(".{BASE_DOMAIN}")).unwrap();
    assert_eq!(label.len(), 10);

    let (status, _) = http_get(server.http_addr, fqdn, "/").await;
    assert_eq!(status, 200);
}
