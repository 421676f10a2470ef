//! Client subcommand implementation

use anyhow::{Context, Result};
use burrow_client::{SessionManager, TunnelEvent, TunnelIntent};
use burrow_common::config::{ClientConfig, TlsConfig};
use clap::Args;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server control-plane address
    #[arg(long, default_value = "127.0.0.1:4443", env = "BURROW_SERVER")]
    server: String,

    /// Authentication token
    #[arg(long, env = "BURROW_TOKEN")]
    token: String,

    /// HTTP tunnel, HOST=LOCAL_ADDR (empty HOST for a random subdomain);
    /// repeatable
    #[arg(long = "http", value_name = "HOST=ADDR")]
    http: Vec<String>,

    /// TCP tunnel, PORT=LOCAL_ADDR (port 0 for any free port); repeatable
    #[arg(long = "tcp", value_name = "PORT=ADDR")]
    tcp: Vec<String>,

    /// UDP tunnel, PORT=LOCAL_ADDR (port 0 for any free port); repeatable
    #[arg(long = "udp", value_name = "PORT=ADDR")]
    udp: Vec<String>,

    /// Connect over TLS
    #[arg(long, env = "BURROW_TLS")]
    tls: bool,

    /// Skip TLS certificate verification (self-signed servers)
    #[arg(long, env = "BURROW_TLS_SKIP_VERIFY")]
    tls_skip_verify: bool,

    /// CA certificate used to verify the server (PEM)
    #[arg(long, env = "BURROW_TLS_CA")]
    tls_ca: Option<PathBuf>,

    /// Secondary data sessions for extra stream parallelism (0-4)
    #[arg(long, default_value_t = 0, env = "BURROW_DATA_SESSIONS")]
    data_sessions: usize,

    /// Pre-opened streams kept ready for the server
    #[arg(long, default_value_t = 256, env = "BURROW_POOL_SIZE")]
    pool_size: usize,
}

fn split_mapping(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('=')
        .with_context(|| format!("expected KEY=LOCAL_ADDR, got {spec:?}"))
}

fn parse_intents(args: &ClientArgs) -> Result<Vec<TunnelIntent>> {
    let mut intents = Vec::new();
    for spec in &args.http {
        let (host, local) = split_mapping(spec)?;
        intents.push(TunnelIntent::http(host, local));
    }
    for spec in &args.tcp {
        let (port, local) = split_mapping(spec)?;
        let port: u16 = port.parse().with_context(|| format!("bad port in {spec:?}"))?;
        intents.push(TunnelIntent::tcp(port, local));
    }
    for spec in &args.udp {
        let (port, local) = split_mapping(spec)?;
        let port: u16 = port.parse().with_context(|| format!("bad port in {spec:?}"))?;
        intents.push(TunnelIntent::udp(port, local));
    }
    anyhow::ensure!(
        !intents.is_empty(),
        "no tunnels requested; pass --http, --tcp or --udp"
    );
    Ok(intents)
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let intents = parse_intents(&args)?;

    let tls = TlsConfig {
        enabled: args.tls || args.tls_skip_verify || args.tls_ca.is_some(),
        ca_cert_path: args.tls_ca.clone(),
        skip_verify: args.tls_skip_verify,
        ..TlsConfig::default()
    };

    let config = ClientConfig {
        server_addr: args.server.clone(),
        token: args.token.clone(),
        tls,
        stream_pool_size: args.pool_size,
        data_sessions: args.data_sessions,
        ..ClientConfig::default()
    };

    let (manager, mut events) = SessionManager::new(config);
    for intent in intents {
        manager.add_tunnel(intent);
    }

    // Report lifecycle events while the manager runs.
    let reporter = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Connected { client_id } => {
                    info!(%client_id, "connected");
                }
                TunnelEvent::Registered {
                    endpoint,
                    local_addr,
                    ..
                } => {
                    info!("{endpoint}  ->  {local_addr}");
                }
                TunnelEvent::RegisterFailed { spec, reason } => {
                    warn!(?spec, %reason, "tunnel rejected");
                }
                TunnelEvent::Disconnected => {
                    warn!("disconnected, reconnecting");
                }
            }
        }
    });

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    manager.close();
    let _ = runner.await;
    reporter.abort();
    Ok(())
}
