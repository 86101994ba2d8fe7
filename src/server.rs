//! Tunnel server
//!
//! The authoritative end of the tunnel. Accepts outer DNS queries,
//! admits them through the security layer, decrypts the inner query,
//! resolves it upstream, and answers with the encrypted response inside
//! a TXT record. TTLs and response timing carry CSPRNG jitter so the
//! answer stream does not fingerprint itself.

use anyhow::{anyhow, Context, Result};
use ring::rand::{SecureRandom, SystemRandom};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::codec::{self, CodecError};
use crate::crypto::{self, Cipher, Role};
use crate::message::{
    Message, Name, MAX_EDNS_SIZE, RCODE_FORMAT_ERROR, RCODE_NAME_ERROR, RCODE_SERVER_FAIL,
};
use crate::security::Security;
use crate::upstream::{parse_upstream, Upstream};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP address to listen on
    pub listen_addr: SocketAddr,

    /// Domain this server is authoritative for
    pub domain: String,

    /// Pre-shared secret
    pub shared_secret: Vec<u8>,

    /// Upstream resolver (8.8.8.8:53, https:// URL, or host:853)
    pub upstream: String,

    /// Truncation threshold for outgoing responses
    pub max_udp_size: usize,

    /// Base TTL for tunnel answers
    pub response_ttl: u32,

    /// Maximum in-flight queries
    pub max_concurrent: usize,

    /// Per-IP rate limit (queries per second)
    pub rate_limit: u32,

    /// Deadline for one upstream resolution
    pub upstream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:53".parse().expect("static address"),
            domain: String::new(),
            shared_secret: Vec::new(),
            upstream: "8.8.8.8:53".to_string(),
            max_udp_size: 1232,
            response_ttl: 60,
            max_concurrent: 1000,
            rate_limit: 100,
            upstream_timeout: Duration::from_secs(5),
        }
    }
}

/// The authoritative tunnel handler. Owns its socket between `start`
/// and `stop`.
pub struct TunnelServer {
    config: ServerConfig,
    domain: Name,
    cipher: Arc<Cipher>,
    upstream: Arc<Upstream>,
    sem: Arc<Semaphore>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TunnelServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let domain =
            Name::parse(&config.domain).map_err(|e| anyhow!("invalid domain: {}", e))?;
        if domain.is_root() {
            anyhow::bail!("authoritative domain is required");
        }

        let cipher =
            Cipher::new(&config.shared_secret, Role::Server).context("failed to create cipher")?;

        let (addr, kind) = parse_upstream(&config.upstream);
        let upstream = Upstream::new(&addr, kind).context("failed to create upstream")?;

        let sem = Arc::new(Semaphore::new(config.max_concurrent));

        Ok(TunnelServer {
            domain,
            cipher: Arc::new(cipher),
            upstream: Arc::new(upstream),
            sem,
            local_addr: None,
            shutdown: None,
            accept_task: None,
            config,
        })
    }

    /// The bound listen address, available after `start`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the socket and starts the accept loop. The security
    /// layer's sweep tasks are spawned here.
    pub async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", self.config.listen_addr))?;
        let socket = Arc::new(socket);
        self.local_addr = Some(socket.local_addr()?);

        log::info!("DNS tunnel server listening on {}", socket.local_addr()?);
        log::info!("authoritative for domain: {}", self.domain);
        log::info!(
            "upstream resolver: {} ({})",
            self.upstream.addr(),
            self.upstream.kind().as_str()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        let handler = Arc::new(Handler {
            domain: self.domain.clone(),
            cipher: Arc::clone(&self.cipher),
            upstream: Arc::clone(&self.upstream),
            security: Security::new(self.config.rate_limit),
            socket: Arc::clone(&socket),
            max_udp_size: self.config.max_udp_size,
            response_ttl: self.config.response_ttl,
            upstream_timeout: self.config.upstream_timeout,
            rng: SystemRandom::new(),
        });

        let sem = Arc::clone(&self.sem);
        self.accept_task = Some(tokio::spawn(accept_loop(socket, handler, sem, shutdown_rx)));

        Ok(())
    }

    /// Signals shutdown and waits for in-flight workers to finish.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        let _ = self
            .sem
            .acquire_many(self.config.max_concurrent as u32)
            .await;

        log::info!("DNS tunnel server stopped");
    }
}

/// Per-datagram processing state shared by workers.
struct Handler {
    domain: Name,
    cipher: Arc<Cipher>,
    upstream: Arc<Upstream>,
    security: Security,
    socket: Arc<UdpSocket>,
    max_udp_size: usize,
    response_ttl: u32,
    upstream_timeout: Duration,
    rng: SystemRandom,
}

async fn accept_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<Handler>,
    sem: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_EDNS_SIZE];
    loop {
        let (n, peer) = tokio::select! {
            _ = shutdown.changed() => return,
            result = socket.recv_from(&mut buf) => match result {
                Ok(r) => r,
                Err(e) => {
                    log::error!("read error: {}", e);
                    continue;
                }
            },
        };

        let data = buf[..n].to_vec();

        let permit = tokio::select! {
            _ = shutdown.changed() => return,
            permit = Arc::clone(&sem).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler.handle_datagram(&data, peer).await;
            drop(permit);
        });
    }
}

impl Handler {
    async fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        if let Err(e) = self.security.validator().validate_datagram(data) {
            log::debug!("dropping datagram from {}: {}", peer, e);
            return;
        }

        let query = match Message::parse(data) {
            Ok(q) => q,
            Err(e) => {
                log::debug!("failed to parse query from {}: {}", peer, e);
                return;
            }
        };

        if query.is_response() {
            return;
        }

        // Rate-limit overruns are dropped without a response so the
        // server stays quiet under probe floods.
        if !self.security.check_rate_limit(peer.ip()) {
            log::debug!("rate limit exceeded for {}", peer.ip());
            return;
        }

        // Clients advertise EDNS 4096; demanding at least the MTU
        // keeps legacy 512-byte speakers out of the tunnel path.
        if let Err(e) = codec::validate_query(&query, &self.domain, self.max_udp_size as u16) {
            let rcode = match e {
                CodecError::NotAuthoritative => RCODE_NAME_ERROR,
                _ => RCODE_FORMAT_ERROR,
            };
            self.send_error(&query, peer, rcode).await;
            return;
        }

        let response = match self.process_tunnel_query(&query).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("tunnel query processing failed: {:#}", e);
                let rcode = match e.downcast_ref::<CodecError>() {
                    Some(CodecError::NotAuthoritative) => RCODE_NAME_ERROR,
                    Some(_) => RCODE_FORMAT_ERROR,
                    None => RCODE_SERVER_FAIL,
                };
                self.send_error(&query, peer, rcode).await;
                return;
            }
        };

        // Anti-fingerprint delay before answering.
        tokio::time::sleep(self.vary_response_delay()).await;

        let mut resp_data = match response.marshal() {
            Ok(d) => d,
            Err(e) => {
                log::error!("failed to marshal response: {}", e);
                return;
            }
        };

        if resp_data.len() > self.max_udp_size {
            resp_data.truncate(self.max_udp_size);
            resp_data[2] |= 0x02; // TC
        }

        if let Err(e) = self.socket.send_to(&resp_data, peer).await {
            log::debug!("failed to send response to {}: {}", peer, e);
        }
    }

    async fn process_tunnel_query(&self, query: &Message) -> Result<Message> {
        let (client_id, sealed) = codec::extract_query_payload(query, &self.domain)?;
        log::debug!("tunnel query from client {}", client_id);

        // Reject envelopes whose nonce was already seen this window
        // before doing any AEAD work.
        let nonce = crypto::envelope_nonce(&sealed)
            .ok_or_else(|| anyhow!(crypto::CryptoError::OpenFailed))?;
        self.security
            .check_replay(&nonce)
            .context("replayed envelope")?;

        let inner_data = self
            .cipher
            .open_timestamped(&sealed)
            .context("failed to decrypt payload")?;

        let inner_query =
            Message::parse(&inner_data).context("failed to parse inner query")?;

        let inner_response = self
            .upstream
            .resolve(&inner_query, self.upstream_timeout)
            .await
            .context("upstream resolution failed")?;

        let response_data = inner_response
            .marshal()
            .context("failed to marshal upstream response")?;

        let sealed_response = self
            .cipher
            .seal_untimestamped(&response_data)
            .context("failed to encrypt response")?;

        let ttl = self.vary_ttl(self.response_ttl);
        let response = codec::create_tunnel_response(query, &sealed_response, ttl)
            .context("failed to create tunnel response")?;

        Ok(response)
    }

    async fn send_error(&self, query: &Message, peer: SocketAddr, rcode: u16) {
        let resp = codec::create_error_response(query, &self.domain, rcode);
        if let Ok(data) = resp.marshal() {
            let _ = self.socket.send_to(&data, peer).await;
        }
    }

    /// TTL jitter of up to ±30 seconds around the configured base.
    fn vary_ttl(&self, base_ttl: u32) -> u32 {
        let delta = self.random_byte() as i64 % 61 - 30;
        (base_ttl as i64 + delta).max(1) as u32
    }

    /// Random 10–100 ms delay before answering.
    fn vary_response_delay(&self) -> Duration {
        let jitter = self.random_byte() as u64 * 90 / 255;
        Duration::from_millis(10 + jitter)
    }

    fn random_byte(&self) -> u8 {
        let mut buf = [0u8; 1];
        // On the vanishingly rare RNG failure, fall back to no jitter
        // rather than failing the query.
        if self.rng.fill(&mut buf).is_err() {
            return 0;
        }
        buf[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            domain: "t.example.com".to_string(),
            shared_secret: vec![0x22; 32],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_udp_size, 1232);
        assert_eq!(config.response_ttl, 60);
        assert_eq!(config.rate_limit, 100);
        assert_eq!(config.max_concurrent, 1000);
    }

    #[test]
    fn test_new_requires_domain_and_key() {
        let mut config = test_config();
        config.domain = String::new();
        assert!(TunnelServer::new(config).is_err());

        let mut config = test_config();
        config.shared_secret = vec![0x22; 8];
        assert!(TunnelServer::new(config).is_err());

        assert!(TunnelServer::new(test_config()).is_ok());
    }

    #[tokio::test]
    async fn test_start_stop_on_ephemeral_port() {
        let mut server = TunnelServer::new(test_config()).unwrap();
        server.start().await.unwrap();
        assert!(server.local_addr().unwrap().port() != 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_ttl_and_delay_jitter_bounds() {
        let handler = Handler {
            domain: Name::parse("t.example.com").unwrap(),
            cipher: Arc::new(Cipher::new(&[0x22; 32], Role::Server).unwrap()),
            upstream: Arc::new(
                Upstream::new("8.8.8.8:53", crate::upstream::UpstreamKind::Udp).unwrap(),
            ),
            security: Security::new(100),
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            max_udp_size: 1232,
            response_ttl: 60,
            upstream_timeout: Duration::from_secs(5),
            rng: SystemRandom::new(),
        };

        for _ in 0..100 {
            let ttl = handler.vary_ttl(60);
            assert!((30..=90).contains(&ttl));

            let delay = handler.vary_response_delay();
            assert!(delay >= Duration::from_millis(10));
            assert!(delay <= Duration::from_millis(100));
        }

        // A tiny base TTL never drops to zero.
        for _ in 0..100 {
            assert!(handler.vary_ttl(5) >= 1);
        }
    }
}
