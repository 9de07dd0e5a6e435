//! TLS for the master/worker channel.
//!
//! Workers are the TLS servers: they present a certificate, generated as a
//! self-signed pair when missing. The master is the client and verifies that
//! certificate against a configured CA, or accepts any certificate when no CA
//! is configured (the token handshake still authenticates the peer).

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{client, TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("No certificates in {0}")]
    NoCertificates(PathBuf),

    #[error("No private key in {0}")]
    NoPrivateKey(PathBuf),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("Certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Write a self-signed certificate and key valid for `names`.
pub fn generate_self_signed(
    cert_path: &Path,
    key_path: &Path,
    names: Vec<String>,
) -> Result<(), TlsError> {
    let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)?;
    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(cert_path, cert.pem())?;
    std::fs::write(key_path, key_pair.serialize_pem())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Make sure the configured certificate and key exist, generating a
/// self-signed pair if allowed. Returns true when a pair was generated.
pub fn ensure_certificate(config: &TlsConfig) -> Result<bool, TlsError> {
    let cert_exists = config.cert_path.exists();
    let key_exists = config.key_path.exists();
    if cert_exists && key_exists {
        return Ok(false);
    }
    if !config.auto_generate {
        return Err(if cert_exists {
            TlsError::KeyNotFound(config.key_path.clone())
        } else {
            TlsError::CertNotFound(config.cert_path.clone())
        });
    }

    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    if !names.contains(&config.server_name) {
        names.push(config.server_name.clone());
    }
    generate_self_signed(&config.cert_path, &config.key_path, names)?;
    tracing::info!(cert = %config.cert_path.display(), "Generated self-signed certificate");
    Ok(true)
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// Server side (worker): certificate from config, generated if needed.
pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    ensure_certificate(config)?;
    let certs = load_certs(&config.cert_path)?;
    let key = load_private_key(&config.key_path)?;

    let server_config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Client side (master) connector plus the name it expects from workers.
#[derive(Clone)]
pub struct ClientTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTls {
    pub fn new(config: &TlsConfig) -> Result<Self, TlsError> {
        let provider = provider();
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?;

        let client_config = match &config.ca_cert_path {
            Some(ca_path) => {
                if !ca_path.exists() {
                    return Err(TlsError::CaCertNotFound(ca_path.clone()));
                }
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots.add(cert)?;
                }
                builder.with_root_certificates(roots).with_no_client_auth()
            }
            None => {
                tracing::warn!("No CA configured; worker certificates are not verified");
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
                    .with_no_client_auth()
            }
        };

        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|_| TlsError::InvalidServerName(config.server_name.clone()))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }

    pub async fn connect(&self, stream: TcpStream) -> std::io::Result<client::TlsStream<TcpStream>> {
        self.connector.connect(self.server_name.clone(), stream).await
    }
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
