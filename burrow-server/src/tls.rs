//! HTTPS certificate selection
//!
//! The HTTPS ingress terminates TLS for many hostnames; certificate lookup
//! is pluggable by SNI through [`CertificateProvider`]. A file-based
//! single-certificate provider covers the common wildcard-cert setup; an
//! ACME-style issuer plugs in the same way.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Looks up the certificate to present for an SNI hostname.
pub trait CertificateProvider: Send + Sync {
    fn certificate_for(&self, sni: &str) -> Option<Arc<CertifiedKey>>;
}

/// One certificate for every hostname (wildcard or test setups).
pub struct SingleCertProvider {
    key: Arc<CertifiedKey>,
}

impl SingleCertProvider {
    pub fn from_files(cert_path: &Path, key_path: &Path) -> io::Result<Self> {
        let certs = burrow_core::transport::tls::load_certs(cert_path)?;
        let key = burrow_core::transport::tls::load_private_key(key_path)?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("bad key: {e}")))?;
        Ok(Self {
            key: Arc::new(CertifiedKey::new(certs, signing_key)),
        })
    }
}

impl CertificateProvider for SingleCertProvider {
    fn certificate_for(&self, _sni: &str) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

/// rustls adapter delegating to the pluggable provider.
#[derive(Debug)]
pub struct SniCertResolver {
    provider: Arc<dyn CertificateProvider>,
}

impl SniCertResolver {
    pub fn new(provider: Arc<dyn CertificateProvider>) -> Self {
        Self { provider }
    }
}

impl std::fmt::Debug for dyn CertificateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CertificateProvider")
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        self.provider.certificate_for(sni)
    }
}

/// Server config for the HTTPS listener: certificate per SNI.
pub fn https_server_config(provider: Arc<dyn CertificateProvider>) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniCertResolver::new(provider)));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}
