//! Server assembly
//!
//! [`TunnelServer`] wires the control-plane listener, the shared HTTP(S)
//! ingress and the registry together. The registry, client map and
//! collaborators travel as one explicit [`ServerContext`]; nothing here is
//! a process-wide singleton.

use crate::auth::{DomainResolver, StaticDomainResolver, StaticTokenValidator, TokenValidator};
use crate::clients::ClientMap;
use crate::http;
use crate::observer::ObserverQueue;
use crate::registry::TunnelRegistry;
use crate::session;
use crate::tls::CertificateProvider;
use burrow_common::config::ServerConfig;
use burrow_common::Result;
use burrow_core::transport::{self, TransportConfig};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared dependencies every server component receives explicitly.
pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: TunnelRegistry,
    pub clients: ClientMap,
    pub validator: Arc<dyn TokenValidator>,
    pub resolver: Arc<dyn DomainResolver>,
    pub observer: ObserverQueue,
}

/// The tunnel server process.
pub struct TunnelServer {
    config: ServerConfig,
    validator: Arc<dyn TokenValidator>,
    resolver: Arc<dyn DomainResolver>,
    observer: ObserverQueue,
    cert_provider: Option<Arc<dyn CertificateProvider>>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            validator: Arc::new(StaticTokenValidator::new(Vec::new())),
            resolver: Arc::new(StaticDomainResolver::default()),
            observer: ObserverQueue::disabled(),
            cert_provider: None,
        }
    }

    #[must_use]
    pub fn with_token_validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_domain_resolver(mut self, resolver: Arc<dyn DomainResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: ObserverQueue) -> Self {
        self.observer = observer;
        self
    }

    /// Certificate lookup for the HTTPS ingress; required when
    /// `https_addr` is configured.
    #[must_use]
    pub fn with_certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.cert_provider = Some(provider);
        self
    }

    /// Bind everything and run until the process is killed. Only fatal
    /// configuration errors (unbindable listeners) return.
    pub async fn run(self) -> Result<()> {
        let ctx = Arc::new(ServerContext {
            registry: TunnelRegistry::new(
                self.config.base_domain.clone(),
                self.config.tcp_port_range.clone(),
                self.config.udp_port_range.clone(),
            ),
            clients: ClientMap::new(),
            validator: self.validator,
            resolver: self.resolver,
            observer: self.observer,
            config: self.config,
        });

        // Public HTTP ingress (shared across all HTTP tunnels).
        let http_listener = TcpListener::bind(ctx.config.http_addr).await?;
        tokio::spawn(http::run_http_ingress(Arc::clone(&ctx), http_listener));

        // Optional HTTPS ingress with SNI certificate lookup.
        if let Some(https_addr) = ctx.config.https_addr {
            let Some(provider) = self.cert_provider else {
                return Err(burrow_common::TunnelError::Config(
                    "https_addr configured without a certificate provider".into(),
                ));
            };
            let tls_config = crate::tls::https_server_config(provider);
            let https_listener = TcpListener::bind(https_addr).await?;
            info!(addr = %https_addr, "https ingress enabled");
            tokio::spawn(http::run_https_ingress(
                Arc::clone(&ctx),
                https_listener,
                tls_config,
            ));
        }

        // Control plane: one session per connected client.
        let transport_config = TransportConfig::from_tls_config(&ctx.config.tls);
        let control_listener = TcpListener::bind(ctx.config.control_addr).await?;
        info!(
            addr = %ctx.config.control_addr,
            base_domain = %ctx.config.base_domain,
            "control plane listening"
        );

        loop {
            match transport::accept(&transport_config, &control_listener).await {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) =
                            session::handle_control_connection(ctx, stream, addr).await
                        {
                            warn!(%addr, error = %e, "session ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control accept error");
                }
            }
        }
    }
}
