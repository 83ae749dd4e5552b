//! Transport Layer
//!
//! Opens the byte stream an MQTT connection runs over: plain TCP, TLS,
//! WebSocket or WebSocket over TLS, chosen from the broker endpoint.

pub mod sigv4;
pub mod tls;
mod websocket;

pub use sigv4::AwsCredentials;
pub use tls::TlsError;
pub use websocket::WsStream;

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Any bidirectional byte stream a connection can run over
pub trait MqttStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> MqttStream for T {}

pub type BoxedStream = Box<dyn MqttStream>;

/// Error type for establishing a broker stream
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Tls(TlsError),
    WebSocket(String),
    InvalidEndpoint(String),
    /// Signing credentials were not available when connecting
    MissingCredentials(String),
    Signing(String),
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {}", e),
            TransportError::Tls(e) => write!(f, "{}", e),
            TransportError::WebSocket(msg) => write!(f, "WebSocket error: {}", msg),
            TransportError::InvalidEndpoint(msg) => write!(f, "Invalid endpoint: {}", msg),
            TransportError::MissingCredentials(msg) => write!(f, "Missing credentials: {}", msg),
            TransportError::Signing(msg) => write!(f, "Signing error: {}", msg),
            TransportError::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<TlsError> for TransportError {
    fn from(e: TlsError) -> Self {
        TransportError::Tls(e)
    }
}

/// Stream kind selected by a URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `mqtt://`
    Tcp,
    /// `mqtts://`
    Tls,
    /// `ws://`
    Ws,
    /// `wss://`
    Wss,
}

impl Scheme {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Some(Scheme::Tcp),
            "mqtts" | "ssl" | "tls" => Some(Scheme::Tls),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Tcp => 1883,
            Scheme::Tls => 8883,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    pub fn uses_tls(self) -> bool {
        matches!(self, Scheme::Tls | Scheme::Wss)
    }

    pub fn uses_websocket(self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

/// A broker address: scheme, host, port and (for WebSocket) request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// Parse `[scheme://]host[:port][/path]`. A missing scheme falls back
    /// to `default_scheme`; a missing port to the scheme's default.
    pub fn parse(raw: &str, default_scheme: Scheme) -> Result<Self, TransportError> {
        let raw = raw.trim();
        let (scheme, rest) = match raw.split_once("://") {
            Some((prefix, rest)) => {
                let scheme = Scheme::from_prefix(prefix).ok_or_else(|| {
                    TransportError::InvalidEndpoint(format!("unsupported scheme '{}'", prefix))
                })?;
                (scheme, rest)
            }
            None => (default_scheme, raw),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/mqtt"),
        };

        let (host, port) = split_host_port(authority)?;
        if host.is_empty() {
            return Err(TransportError::InvalidEndpoint(format!(
                "missing host in '{}'",
                raw
            )));
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            path: path.to_string(),
        })
    }

    /// Host as it appears in a URL authority; IPv6 literals are bracketed
    fn authority_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    /// Value of the HTTP Host header; the port is omitted when it is the default
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.authority_host()
        } else {
            format!("{}:{}", self.authority_host(), self.port)
        }
    }

    /// WebSocket URL for this endpoint with an optional query string
    pub fn ws_url(&self, query: Option<&str>) -> String {
        let scheme = if self.scheme.uses_tls() { "wss" } else { "ws" };
        match query {
            Some(q) => format!("{}://{}{}?{}", scheme, self.host_header(), self.path, q),
            None => format!("{}://{}{}", scheme, self.host_header(), self.path),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Tcp => "mqtt",
            Scheme::Tls => "mqtts",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        };
        write!(f, "{}://{}:{}", scheme, self.authority_host(), self.port)?;
        if self.scheme.uses_websocket() {
            write!(f, "{}", self.path)?;
        }
        Ok(())
    }
}

fn split_host_port(authority: &str) -> Result<(&str, Option<u16>), TransportError> {
    let parse_port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| TransportError::InvalidEndpoint(format!("invalid port '{}'", port)))
    };

    // Bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| TransportError::InvalidEndpoint(authority.to_string()))?;
        return match after.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(port)?))),
            None => Ok((host, None)),
        };
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(port)?))),
        None => Ok((authority, None)),
    }
}

/// How the stream to a broker is authenticated
#[derive(Clone, PartialEq, Eq)]
pub enum BrokerAuth {
    /// No transport-level credentials
    Anonymous,
    /// TLS client certificate and private key, PEM encoded
    ClientCertificate { cert_pem: String, key_pem: String },
    /// AWS SigV4 presigned WebSocket URL
    SignatureV4 {
        credentials: Option<AwsCredentials>,
        region: Option<String>,
    },
}

impl std::fmt::Debug for BrokerAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerAuth::Anonymous => write!(f, "Anonymous"),
            BrokerAuth::ClientCertificate { .. } => write!(f, "ClientCertificate {{ .. }}"),
            BrokerAuth::SignatureV4 {
                credentials,
                region,
            } => f
                .debug_struct("SignatureV4")
                .field("credentials", credentials)
                .field("region", region)
                .finish(),
        }
    }
}

impl BrokerAuth {
    fn client_identity(&self) -> Option<(&str, &str)> {
        match self {
            BrokerAuth::ClientCertificate { cert_pem, key_pem } => {
                Some((cert_pem.as_str(), key_pem.as_str()))
            }
            _ => None,
        }
    }

    /// Scheme used when the host string carries none
    pub fn default_scheme(&self) -> Scheme {
        match self {
            BrokerAuth::Anonymous => Scheme::Tcp,
            BrokerAuth::ClientCertificate { .. } => Scheme::Tls,
            BrokerAuth::SignatureV4 { .. } => Scheme::Wss,
        }
    }
}

/// Open a stream to the endpoint, bounded by `timeout`
pub async fn connect(
    endpoint: &Endpoint,
    auth: &BrokerAuth,
    timeout: Duration,
) -> Result<BoxedStream, TransportError> {
    tokio::time::timeout(timeout, connect_inner(endpoint, auth))
        .await
        .map_err(|_| TransportError::Timeout)?
}

async fn connect_inner(
    endpoint: &Endpoint,
    auth: &BrokerAuth,
) -> Result<BoxedStream, TransportError> {
    // Sign first so missing credentials fail before any network traffic
    let query = match (endpoint.scheme.uses_websocket(), auth) {
        (
            true,
            BrokerAuth::SignatureV4 {
                credentials,
                region,
            },
        ) => {
            let credentials = credentials.as_ref().ok_or_else(|| {
                TransportError::MissingCredentials(
                    "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are not set".to_string(),
                )
            })?;
            let region = region.as_deref().ok_or_else(|| {
                TransportError::MissingCredentials("AWS region is not known".to_string())
            })?;
            Some(sigv4::presign_query(
                &endpoint.host_header(),
                &endpoint.path,
                region,
                credentials,
                Utc::now(),
            )?)
        }
        _ => None,
    };

    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await?;
    tcp.set_nodelay(true)?;
    debug!("TCP connected to {}", endpoint);

    let mut stream: BoxedStream = Box::new(tcp);

    if endpoint.scheme.uses_tls() {
        let config = tls::client_config(auth.client_identity())?;
        stream = Box::new(tls::connect(config, &endpoint.host, stream).await?);
        debug!("TLS established with {}", endpoint.host);
    }

    if endpoint.scheme.uses_websocket() {
        let url = endpoint.ws_url(query.as_deref());
        let ws = WsStream::connect(&url, stream)
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        stream = Box::new(ws);
        debug!("WebSocket upgraded at {}", endpoint);
    }

    Ok(stream)
}
