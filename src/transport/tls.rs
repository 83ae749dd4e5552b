//! Client TLS setup
//!
//! Server certificates are verified against the bundled webpki roots.
//! Certificate-authenticated brokers additionally get a client certificate
//! chain and private key, both given as PEM text.

use std::sync::Arc;

use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use super::BoxedStream;

/// Error type for TLS setup
#[derive(Debug)]
pub enum TlsError {
    /// IO error during the handshake
    Io(std::io::Error),
    /// Certificate parsing error
    CertificateError(String),
    /// Private key error
    PrivateKeyError(String),
    /// Host is not a valid DNS name or IP address
    InvalidServerName(String),
    /// TLS configuration error
    ConfigError(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "IO error: {}", e),
            TlsError::CertificateError(msg) => write!(f, "Certificate error: {}", msg),
            TlsError::PrivateKeyError(msg) => write!(f, "Private key error: {}", msg),
            TlsError::InvalidServerName(host) => write!(f, "Invalid server name: {}", host),
            TlsError::ConfigError(msg) => write!(f, "TLS config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

/// Environment variables often carry PEM text with escaped newlines
fn normalize_pem(pem: &str) -> String {
    pem.replace("\\n", "\n")
}

/// Parse a PEM certificate chain
fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let pem = normalize_pem(pem);
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertificateError(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::CertificateError(
            "No certificates found in PEM".to_string(),
        ));
    }

    Ok(certs)
}

/// Parse a PEM private key (PKCS#1, PKCS#8 or SEC1)
fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = normalize_pem(pem);
    PrivateKeyDer::from_pem_slice(pem.as_bytes())
        .map_err(|e| TlsError::PrivateKeyError(format!("Failed to parse private key: {}", e)))
}

/// Build a client configuration, with a client certificate when
/// `identity` is `Some((cert_pem, key_pem))`
pub fn client_config(identity: Option<(&str, &str)>) -> Result<Arc<ClientConfig>, TlsError> {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    let config = match identity {
        Some((cert_pem, key_pem)) => {
            let certs = parse_certs(cert_pem)?;
            let key = parse_private_key(key_pem)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| TlsError::ConfigError(format!("Failed to build TLS config: {}", e)))?
        }
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Run the TLS handshake over an established stream
pub async fn connect(
    config: Arc<ClientConfig>,
    host: &str,
    stream: BoxedStream,
) -> Result<TlsStream<BoxedStream>, TlsError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;

    let stream = TlsConnector::from(config)
        .connect(server_name, stream)
        .await?;
    Ok(stream)
}
