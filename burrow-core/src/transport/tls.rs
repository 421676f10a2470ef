//! TLS transport using rustls

use super::socket_tuning::configure_socket_silent;
use super::BoxedStream;
use burrow_common::config::TlsConfig;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Clone, Default)]
pub struct TlsTransportConfig {
    pub ca_cert_path: Option<String>,
    pub cert_path: String,
    pub key_path: String,
    pub server_name: Option<String>,
    pub skip_verify: bool,
}

impl From<&TlsConfig> for TlsTransportConfig {
    fn from(cfg: &TlsConfig) -> Self {
        let path_str =
            |p: &Option<std::path::PathBuf>| p.as_ref().map(|p| p.to_string_lossy().to_string());
        Self {
            ca_cert_path: path_str(&cfg.ca_cert_path),
            cert_path: path_str(&cfg.cert_path).unwrap_or_default(),
            key_path: path_str(&cfg.key_path).unwrap_or_default(),
            server_name: cfg.server_name.clone(),
            skip_verify: cfg.skip_verify,
        }
    }
}

pub fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))
}

pub fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, "no private key found"))
}

/// Accepts any server certificate. Only reachable through `skip_verify`,
/// meant for self-signed development setups.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

pub fn create_client_config(config: &TlsTransportConfig) -> io::Result<Arc<ClientConfig>> {
    if config.skip_verify {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
            .with_no_client_auth();
        return Ok(Arc::new(client_config));
    }

    let mut root_store = RootCertStore::empty();
    if let Some(ca_path) = &config.ca_cert_path {
        let ca_certs = load_certs(Path::new(ca_path))?;
        for cert in ca_certs {
            root_store.add(cert).map_err(|e| {
                io::Error::new(ErrorKind::InvalidData, format!("invalid CA cert: {e}"))
            })?;
        }
    } else {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "CA certificate path required for TLS (or set skip_verify)",
        ));
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(Arc::new(client_config))
}

pub fn create_server_config(config: &TlsTransportConfig) -> io::Result<Arc<ServerConfig>> {
    let certs = load_certs(Path::new(&config.cert_path))?;
    let key = load_private_key(Path::new(&config.key_path))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, format!("TLS config error: {e}")))?;

    Ok(Arc::new(server_config))
}

pub async fn connect(addr: &str, config: &TlsTransportConfig) -> io::Result<BoxedStream> {
    let client_config = create_client_config(config)?;
    let connector = TlsConnector::from(client_config);

    let tcp_stream = TcpStream::connect(addr).await?;
    configure_socket_silent(&tcp_stream);

    let host = config
        .server_name
        .clone()
        .unwrap_or_else(|| addr.split(':').next().unwrap_or("localhost").to_string());
    let server_name = ServerName::try_from(host)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, format!("invalid server name: {e}")))?;

    let tls_stream = connector.connect(server_name, tcp_stream).await?;
    Ok(Box::pin(tls_stream))
}

pub async fn accept_tls(
    tcp_stream: TcpStream,
    config: &TlsTransportConfig,
) -> io::Result<tokio_rustls::server::TlsStream<TcpStream>> {
    let server_config = create_server_config(config)?;
    let acceptor = TlsAcceptor::from(server_config);
    acceptor.accept(tcp_stream).await
}
