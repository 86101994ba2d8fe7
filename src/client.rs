//! Tunnel client
//!
//! Listens for plain DNS queries on loopback, wraps each one in an
//! authenticated envelope encoded into a query name under the tunnel
//! domain, races it across the configured public recursives, and hands
//! the decrypted answer back to the application with its original ID.

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::codec::{self, ClientId};
use crate::crypto::{Cipher, Role};
use crate::message::{
    self, Message, Name, Question, CLASS_IN, MAX_EDNS_SIZE, RCODE_FORMAT_ERROR, RCODE_NO_ERROR,
    RCODE_SERVER_FAIL, RR_TYPE_A, RR_TYPE_AAAA, RR_TYPE_TXT,
};
use crate::transport::Transport;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address to listen on for application DNS queries
    pub listen_addr: SocketAddr,

    /// Tunnel server domain (e.g. t.example.com)
    pub server_domain: String,

    /// Public DNS resolvers used as blind carriers
    pub resolvers: Vec<String>,

    /// Pre-shared secret
    pub shared_secret: Vec<u8>,

    /// Deadline for one tunneled exchange
    pub timeout: Duration,

    /// Maximum in-flight tunneled queries
    pub max_concurrent: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            listen_addr: "127.0.0.1:53".parse().expect("static address"),
            server_domain: String::new(),
            resolvers: vec![
                "8.8.8.8:53".to_string(),
                "1.1.1.1:53".to_string(),
                "9.9.9.9:53".to_string(),
            ],
            shared_secret: Vec::new(),
            timeout: Duration::from_secs(2),
            max_concurrent: 100,
        }
    }
}

/// The client listener. One per process; owns its UDP socket between
/// `start` and `stop`.
pub struct TunnelClient {
    config: ClientConfig,
    domain: Name,
    cipher: Arc<Cipher>,
    client_id: ClientId,
    transport: Arc<Transport>,
    sem: Arc<Semaphore>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TunnelClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let domain = Name::parse(&config.server_domain)
            .map_err(|e| anyhow!("invalid server domain: {}", e))?;
        if domain.is_root() {
            bail!("server domain is required");
        }

        let cipher =
            Cipher::new(&config.shared_secret, Role::Client).context("failed to create cipher")?;

        let transport = Transport::new(config.resolvers.clone(), config.timeout);
        let sem = Arc::new(Semaphore::new(config.max_concurrent));

        Ok(TunnelClient {
            domain,
            cipher: Arc::new(cipher),
            client_id: ClientId::random(),
            transport: Arc::new(transport),
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

    /// Snapshot of per-resolver transport statistics.
    pub fn resolver_stats(&self) -> std::collections::HashMap<String, crate::transport::ResolverStats> {
        self.transport.stats()
    }

    /// Binds the listen socket and starts accepting queries.
    pub async fn start(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to listen on {}", self.config.listen_addr))?;
        let socket = Arc::new(socket);
        self.local_addr = Some(socket.local_addr()?);

        log::info!("DNS tunnel client listening on {}", socket.local_addr()?);
        log::info!("server domain: {}", self.domain);
        log::info!("using {} resolvers", self.config.resolvers.len());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown = Some(shutdown_tx);

        let worker = Arc::new(Worker {
            domain: self.domain.clone(),
            cipher: Arc::clone(&self.cipher),
            client_id: self.client_id,
            transport: Arc::clone(&self.transport),
            socket: Arc::clone(&socket),
        });

        let sem = Arc::clone(&self.sem);
        self.accept_task = Some(tokio::spawn(accept_loop(socket, worker, sem, shutdown_rx)));

        Ok(())
    }

    /// Signals shutdown, waits for in-flight workers to drain, and
    /// releases the socket.
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }

        // Every worker holds a permit; acquiring them all means the
        // last worker has finished.
        let _ = self
            .sem
            .acquire_many(self.config.max_concurrent as u32)
            .await;

        log::info!("DNS tunnel client stopped");
    }
}

/// Shared state for query workers.
struct Worker {
    domain: Name,
    cipher: Arc<Cipher>,
    client_id: ClientId,
    transport: Arc<Transport>,
    socket: Arc<UdpSocket>,
}

async fn accept_loop(
    socket: Arc<UdpSocket>,
    worker: Arc<Worker>,
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

        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            worker.handle_query(&data, peer).await;
            drop(permit);
        });
    }
}

impl Worker {
    /// Drives one application query through the tunnel.
    async fn handle_query(&self, data: &[u8], peer: SocketAddr) {
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

        if query.question.len() != 1 {
            self.send_error(&query, peer, RCODE_FORMAT_ERROR).await;
            return;
        }

        let response = match self.process_tunneled_query(&query).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("tunnel query failed: {:#}", e);
                self.send_error(&query, peer, RCODE_SERVER_FAIL).await;
                return;
            }
        };

        let resp_data = match response.marshal() {
            Ok(d) => d,
            Err(e) => {
                log::error!("failed to marshal response: {}", e);
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&resp_data, peer).await {
            log::debug!("failed to send response to {}: {}", peer, e);
        }
    }

    /// Seal, encode, race, decode, open. Returns the inner response
    /// with its ID rewritten to the application's.
    async fn process_tunneled_query(&self, query: &Message) -> Result<Message> {
        let inner_data = query.marshal().context("failed to marshal inner query")?;

        let sealed = self
            .cipher
            .seal_timestamped(&inner_data)
            .context("failed to encrypt query")?;

        let tunnel_name = codec::encode_payload(&sealed, self.client_id, &self.domain)
            .context("failed to encode payload")?;

        let mut outer = Message {
            id: codec::generate_query_id(),
            flags: 0x0100, // RD=1
            question: vec![Question {
                name: tunnel_name,
                qtype: vary_query_type(),
                class: CLASS_IN,
            }],
            ..Default::default()
        };
        outer.add_edns0(MAX_EDNS_SIZE as u16);

        let outer_data = outer.marshal().context("failed to marshal outer query")?;

        let resp_data = self
            .transport
            .query(&outer_data)
            .await
            .context("transport query failed")?;

        let tunnel_resp =
            Message::parse(&resp_data).context("failed to parse tunnel response")?;

        if tunnel_resp.rcode() != RCODE_NO_ERROR {
            bail!("tunnel response error: rcode {}", tunnel_resp.rcode());
        }

        let payload = codec::extract_response_payload(&tunnel_resp, &self.domain)
            .context("failed to extract response payload")?;

        let opened = self
            .cipher
            .open_untimestamped(&payload)
            .context("failed to decrypt response")?;

        let mut response =
            Message::parse(&opened).context("failed to parse decrypted response")?;

        response.id = query.id;

        Ok(response)
    }

    async fn send_error(&self, query: &Message, peer: SocketAddr, rcode: u16) {
        let mut resp = message::create_response(query);
        resp.set_rcode(rcode);

        if let Ok(data) = resp.marshal() {
            let _ = self.socket.send_to(&data, peer).await;
        }
    }
}

/// Outer query type: mostly TXT, with occasional A/AAAA so the stream
/// of tunnel queries is not uniform.
fn vary_query_type() -> u16 {
    let roll: u8 = rand::thread_rng().gen();
    match roll {
        0..=204 => RR_TYPE_TXT, // ~80%
        205..=229 => RR_TYPE_A, // ~10%
        _ => RR_TYPE_AAAA,      // ~10%
    }
}
