//! Chapar: Covert DNS Resolver Tunnel
//!
//! Chapar carries ordinary DNS resolution through public recursive
//! resolvers as a blind relay, hiding both the queried names and the
//! answers from on-path observers and DoH/DoT blocking.
//!
//! ## How it works
//!
//! The local client accepts plain DNS queries on loopback, seals each
//! one in an authenticated ChaCha20-Poly1305 envelope, encodes the
//! envelope into base32 labels under a cooperating zone, and sends the
//! result as an ordinary TXT query to several public recursives at
//! once. Standard delegation brings the query to the tunnel server,
//! which is authoritative for the zone: it decrypts the inner query,
//! resolves it upstream (UDP, DoH, or DoT), and returns the encrypted
//! answer inside a TXT record.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chapar::{ClientConfig, TunnelClient};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ClientConfig {
//!     server_domain: "t.example.com".to_string(),
//!     shared_secret: chapar::crypto::parse_hex_key("11".repeat(32).as_str())?,
//!     ..Default::default()
//! };
//!
//! let mut client = TunnelClient::new(config)?;
//! client.start().await?;
//! // ... route local DNS at the listen address ...
//! client.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐     ┌──────────────┐
//! │ Application │────▶│    Chapar    │────▶│   Public    │────▶│    Chapar    │
//! │  (DNS/UDP)  │     │    Client    │     │  Recursive  │     │    Server    │
//! └─────────────┘     └──────────────┘     └─────────────┘     └──────┬───────┘
//!                            │                                        │
//!                            │ seal + base32 labels                   │ UDP / DoH / DoT
//!                            ▼                                        ▼
//!                     ┌──────────────┐                         ┌──────────────┐
//!                     │   Envelope   │                         │   Upstream   │
//!                     │  (ChaCha20)  │                         │   Resolver   │
//!                     └──────────────┘                         └──────────────┘
//! ```
//!
//! The zone must delegate the tunnel subdomain to the server:
//! `NS t.example.com → tns.example.com`, `A tns.example.com → <server>`.

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod message;
pub mod security;
pub mod server;
pub mod transport;
pub mod upstream;

// Re-export core types
pub use client::{ClientConfig, TunnelClient};
pub use codec::{ClientId, CodecError};
pub use config::{ClientFileConfig, KeyConfig, ServerFileConfig};
pub use crypto::{Cipher, CryptoError, ReplayCache, Role};
pub use message::{Message, Name, Question, Rr, WireError};
pub use security::{ConnectionTracker, InputValidator, RateLimiter, Security};
pub use server::{ServerConfig, TunnelServer};
pub use transport::{ResolverStats, Transport};
pub use upstream::{Upstream, UpstreamError, UpstreamKind};
