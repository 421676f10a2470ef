//! Server subcommand implementation

use anyhow::{Context, Result};
use burrow_common::config::{ServerConfig, TlsConfig};
use burrow_server::observer::ObserverQueue;
use burrow_server::tls::SingleCertProvider;
use burrow_server::{ExchangeLog, StaticTokenValidator, TunnelServer};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Control-plane bind address (tunnel sessions)
    #[arg(long, default_value = "0.0.0.0:4443", env = "BURROW_CONTROL_BIND")]
    control_bind: SocketAddr,

    /// Public HTTP ingress bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "BURROW_HTTP_BIND")]
    http_bind: SocketAddr,

    /// Public HTTPS ingress bind address (requires --https-cert/--https-key)
    #[arg(long, env = "BURROW_HTTPS_BIND")]
    https_bind: Option<SocketAddr>,

    /// Authentication token clients must present
    #[arg(long, env = "BURROW_TOKEN")]
    token: String,

    /// Base domain subdomains hang under (e.g. tunnel.example.com)
    #[arg(long, default_value = "localhost", env = "BURROW_BASE_DOMAIN")]
    base_domain: String,

    /// Additional base domains (repeatable)
    #[arg(long = "alias", env = "BURROW_ALIASES", value_delimiter = ',')]
    aliases: Vec<String>,

    /// Leasable TCP port range, MIN-MAX
    #[arg(long, default_value = "10000-20000", env = "BURROW_TCP_PORTS")]
    tcp_ports: String,

    /// Leasable UDP port range, MIN-MAX
    #[arg(long, default_value = "20001-30000", env = "BURROW_UDP_PORTS")]
    udp_ports: String,

    /// TLS certificate for the control listener (PEM)
    #[arg(long, env = "BURROW_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS private key for the control listener (PEM)
    #[arg(long, env = "BURROW_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Certificate for the HTTPS ingress (PEM)
    #[arg(long, env = "BURROW_HTTPS_CERT")]
    https_cert: Option<PathBuf>,

    /// Private key for the HTTPS ingress (PEM)
    #[arg(long, env = "BURROW_HTTPS_KEY")]
    https_key: Option<PathBuf>,

    /// Keep an in-memory log of recent HTTP exchanges
    #[arg(long, env = "BURROW_INSPECT")]
    inspect: bool,

    /// Exchanges retained by the inspection log
    #[arg(long, default_value_t = 256, env = "BURROW_INSPECT_ENTRIES")]
    inspect_entries: usize,

    /// Body bytes captured per exchange
    #[arg(long, default_value_t = 16 * 1024, env = "BURROW_INSPECT_BODY")]
    inspect_body: usize,
}

fn parse_range(spec: &str) -> Result<std::ops::RangeInclusive<u16>> {
    let (min, max) = spec
        .split_once('-')
        .context("port range must be MIN-MAX")?;
    let min: u16 = min.trim().parse().context("invalid range start")?;
    let max: u16 = max.trim().parse().context("invalid range end")?;
    anyhow::ensure!(min <= max, "port range start exceeds end");
    Ok(min..=max)
}

pub async fn run(args: ServerArgs) -> Result<()> {
    info!("starting burrow server v{}", env!("CARGO_PKG_VERSION"));

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => TlsConfig {
            enabled: true,
            cert_path: Some(cert.clone()),
            key_path: Some(key.clone()),
            ..TlsConfig::default()
        },
        (None, None) => TlsConfig::default(),
        _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
    };

    let config = ServerConfig {
        control_addr: args.control_bind,
        http_addr: args.http_bind,
        https_addr: args.https_bind,
        base_domain: args.base_domain,
        aliases: args.aliases,
        tcp_port_range: parse_range(&args.tcp_ports)?,
        udp_port_range: parse_range(&args.udp_ports)?,
        tls,
        ..ServerConfig::default()
    };

    let mut server = TunnelServer::new(config)
        .with_token_validator(Arc::new(StaticTokenValidator::single(args.token, "default")));

    if args.inspect {
        let log = Arc::new(ExchangeLog::new(args.inspect_entries));
        server = server.with_observer(ObserverQueue::spawn(log, 64, args.inspect_body));
        info!(
            entries = args.inspect_entries,
            body_bytes = args.inspect_body,
            "http inspection enabled"
        );
    }

    if args.https_bind.is_some() {
        let (cert, key) = match (&args.https_cert, &args.https_key) {
            (Some(cert), Some(key)) => (cert, key),
            _ => anyhow::bail!("--https-bind requires --https-cert and --https-key"),
        };
        let provider = SingleCertProvider::from_files(cert, key)
            .context("loading HTTPS certificate")?;
        server = server.with_certificate_provider(Arc::new(provider));
    }

    server.run().await.context("server terminated")
}
