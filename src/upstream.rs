//! Upstream resolution for the tunnel server
//!
//! The server performs the real lookup for each decrypted inner query
//! against one configured upstream: plain UDP, DNS-over-HTTPS (POST of
//! the wire format, RFC 8484), or DNS-over-TLS (2-byte length-prefixed
//! framing over TLS, RFC 7858) with a small LIFO connection pool.

use rustls::pki_types::ServerName;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::message::{Message, WireError, MAX_EDNS_SIZE};

/// Idle DoT connections kept per upstream
const DOT_POOL_SIZE: usize = 10;

/// Hard cap on a single DoH request, independent of the caller deadline
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Expected content type for DoH exchanges (RFC 8484)
const DNS_MESSAGE_CONTENT_TYPE: &str = "application/dns-message";

/// Errors produced by upstream resolution.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid upstream address: {0}")]
    InvalidAddress(String),

    #[error("upstream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("upstream exchange timed out")]
    Timeout,

    #[error("DoH request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DoH returned status {0}")]
    HttpStatus(u16),

    #[error("upstream response too large: {0} bytes")]
    ResponseTooLarge(usize),

    #[error("invalid TLS server name")]
    TlsServerName,

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// How the upstream is spoken to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Udp,
    Doh,
    Dot,
}

impl UpstreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamKind::Udp => "udp",
            UpstreamKind::Doh => "doh",
            UpstreamKind::Dot => "dot",
        }
    }
}

/// Parses an upstream configuration string.
///
/// An `https://` prefix selects DoH, a `:853` suffix selects DoT, anything else
/// is plain UDP with `:53` appended when no port is given.
pub fn parse_upstream(spec: &str) -> (String, UpstreamKind) {
    let spec = spec.trim();

    if spec.starts_with("https://") {
        return (spec.to_string(), UpstreamKind::Doh);
    }

    if spec.ends_with(":853") {
        return (spec.to_string(), UpstreamKind::Dot);
    }

    if spec.contains(':') {
        (spec.to_string(), UpstreamKind::Udp)
    } else {
        (format!("{}:53", spec), UpstreamKind::Udp)
    }
}

/// A process-lifetime upstream resolver.
pub struct Upstream {
    addr: String,
    kind: UpstreamKind,

    // DoH
    http_client: Option<reqwest::Client>,

    // DoT
    tls_connector: Option<TlsConnector>,
    tls_server_name: Option<ServerName<'static>>,
    dot_pool: Mutex<Vec<TlsStream<TcpStream>>>,
}

impl Upstream {
    pub fn new(addr: &str, kind: UpstreamKind) -> Result<Self, UpstreamError> {
        let mut upstream = Upstream {
            addr: addr.to_string(),
            kind,
            http_client: None,
            tls_connector: None,
            tls_server_name: None,
            dot_pool: Mutex::new(Vec::new()),
        };

        match kind {
            UpstreamKind::Udp => {}

            UpstreamKind::Doh => {
                let client = reqwest::Client::builder()
                    .use_rustls_tls()
                    .timeout(DEFAULT_TIMEOUT)
                    .pool_max_idle_per_host(DOT_POOL_SIZE)
                    .build()?;
                upstream.http_client = Some(client);
            }

            UpstreamKind::Dot => {
                let host = addr
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(addr)
                    .to_string();

                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

                let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

                let config = rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth();

                upstream.tls_connector = Some(TlsConnector::from(Arc::new(config)));
                upstream.tls_server_name =
                    Some(ServerName::try_from(host).map_err(|_| UpstreamError::TlsServerName)?);
            }
        }

        Ok(upstream)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn kind(&self) -> UpstreamKind {
        self.kind
    }

    /// Resolves the inner query against the upstream and returns the
    /// parsed response with its ID rewritten to match the query.
    pub async fn resolve(
        &self,
        query: &Message,
        deadline: Duration,
    ) -> Result<Message, UpstreamError> {
        let query_data = query.marshal()?;

        let exchange = async {
            match self.kind {
                UpstreamKind::Udp => self.exchange_udp(&query_data).await,
                UpstreamKind::Doh => self.exchange_doh(&query_data).await,
                UpstreamKind::Dot => self.exchange_dot(&query_data).await,
            }
        };
        let response_data = tokio::time::timeout(deadline, exchange)
            .await
            .map_err(|_| UpstreamError::Timeout)??;

        let mut response = Message::parse(&response_data)?;

        // Recursives normally preserve IDs; rewriting keeps a
        // misbehaving one from desynchronising the tunnel.
        response.id = query.id;

        Ok(response)
    }

    async fn exchange_udp(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.addr).await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; MAX_EDNS_SIZE];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn exchange_doh(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        let client = self
            .http_client
            .as_ref()
            .expect("DoH upstream without HTTP client");

        let response = client
            .post(&self.addr)
            .header("Content-Type", DNS_MESSAGE_CONTENT_TYPE)
            .header("Accept", DNS_MESSAGE_CONTENT_TYPE)
            .body(query.to_vec())
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(UpstreamError::HttpStatus(status.as_u16()));
        }

        let body = response.bytes().await?;
        if body.len() > MAX_EDNS_SIZE {
            return Err(UpstreamError::ResponseTooLarge(body.len()));
        }

        Ok(body.to_vec())
    }

    async fn exchange_dot(&self, query: &[u8]) -> Result<Vec<u8>, UpstreamError> {
        // A pooled connection may have been closed by the peer; retry
        // once on a fresh dial before giving up.
        if let Some(mut stream) = self.take_pooled() {
            match self.exchange_on_stream(&mut stream, query).await {
                Ok(response) => {
                    self.return_to_pool(stream);
                    return Ok(response);
                }
                Err(e) => {
                    log::debug!("pooled DoT connection to {} stale: {}", self.addr, e);
                }
            }
        }

        let mut stream = self.connect_dot().await?;
        let response = self.exchange_on_stream(&mut stream, query).await?;
        self.return_to_pool(stream);
        Ok(response)
    }

    async fn connect_dot(&self) -> Result<TlsStream<TcpStream>, UpstreamError> {
        let connector = self
            .tls_connector
            .as_ref()
            .expect("DoT upstream without TLS connector");
        let server_name = self
            .tls_server_name
            .as_ref()
            .expect("DoT upstream without server name")
            .clone();

        let tcp = TcpStream::connect(&self.addr).await?;
        let stream = connector.connect(server_name, tcp).await?;
        Ok(stream)
    }

    /// One length-prefixed exchange, TCP DNS framing.
    async fn exchange_on_stream(
        &self,
        stream: &mut TlsStream<TcpStream>,
        query: &[u8],
    ) -> Result<Vec<u8>, UpstreamError> {
        let len = query.len() as u16;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(query).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let response_len = u16::from_be_bytes(len_buf) as usize;
        if response_len > MAX_EDNS_SIZE {
            return Err(UpstreamError::ResponseTooLarge(response_len));
        }

        let mut response = vec![0u8; response_len];
        stream.read_exact(&mut response).await?;
        Ok(response)
    }

    fn take_pooled(&self) -> Option<TlsStream<TcpStream>> {
        self.dot_pool.lock().expect("DoT pool poisoned").pop()
    }

    fn return_to_pool(&self, stream: TlsStream<TcpStream>) {
        let mut pool = self.dot_pool.lock().expect("DoT pool poisoned");
        if pool.len() < DOT_POOL_SIZE {
            pool.push(stream);
        }
        // A full pool drops the stream, which closes it.
    }
}
