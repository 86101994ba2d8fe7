//! Chapar configuration
//!
//! TOML mirror of the command-line surface. Either side of the tunnel
//! can be driven from a file with `--config`; flags override file
//! values. The shared secret is given inline as hex or through a
//! key-file indirection.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto;

fn default_client_listen() -> SocketAddr {
    "127.0.0.1:53".parse().expect("static address")
}

fn default_server_listen() -> SocketAddr {
    "0.0.0.0:53".parse().expect("static address")
}

fn default_resolvers() -> Vec<String> {
    vec![
        "8.8.8.8:53".to_string(),
        "1.1.1.1:53".to_string(),
        "9.9.9.9:53".to_string(),
    ]
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_upstream() -> String {
    "8.8.8.8:53".to_string()
}

fn default_mtu() -> usize {
    1232
}

fn default_ttl() -> u32 {
    60
}

fn default_rate_limit() -> u32 {
    100
}

/// Shared key material: inline hex or a file containing it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Encryption key (64 hex characters)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// File containing the encryption key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

impl KeyConfig {
    /// Resolves the configured key material to raw bytes.
    pub fn load(&self) -> Result<Vec<u8>> {
        if let Some(path) = &self.key_file {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read key file {}", path.display()))?;
            return crypto::parse_hex_key(&contents).context("invalid key in file");
        }
        if let Some(key) = &self.key {
            return crypto::parse_hex_key(key).context("invalid key format");
        }
        bail!("encryption key is required (key or key_file)");
    }
}

/// Client-side file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFileConfig {
    /// Address to listen for DNS queries
    #[serde(default = "default_client_listen")]
    pub listen: SocketAddr,

    /// Tunnel server domain (e.g. t.example.com)
    pub domain: String,

    /// Public DNS resolvers to race
    #[serde(default = "default_resolvers")]
    pub resolvers: Vec<String>,

    /// Query timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(flatten)]
    pub key: KeyConfig,
}

impl Default for ClientFileConfig {
    fn default() -> Self {
        ClientFileConfig {
            listen: default_client_listen(),
            domain: String::new(),
            resolvers: default_resolvers(),
            timeout_ms: default_timeout_ms(),
            key: KeyConfig::default(),
        }
    }
}

impl ClientFileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("invalid client config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            bail!("server domain is required");
        }
        if self.resolvers.is_empty() {
            bail!("at least one resolver is required");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Server-side file configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerFileConfig {
    /// UDP address to listen on
    #[serde(default = "default_server_listen")]
    pub listen: SocketAddr,

    /// Domain the server is authoritative for
    pub domain: String,

    /// Upstream resolver (UDP host:port, https:// URL, or host:853)
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Maximum UDP payload before truncation
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Base response TTL in seconds
    #[serde(default = "default_ttl")]
    pub ttl: u32,

    /// Per-IP rate limit in queries per second
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    #[serde(flatten)]
    pub key: KeyConfig,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        ServerFileConfig {
            listen: default_server_listen(),
            domain: String::new(),
            upstream: default_upstream(),
            mtu: default_mtu(),
            ttl: default_ttl(),
            rate_limit: default_rate_limit(),
            key: KeyConfig::default(),
        }
    }
}

impl ServerFileConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&contents).context("invalid server config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            bail!("authoritative domain is required");
        }
        if self.mtu < 512 {
            bail!("mtu must be at least 512");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_parses_with_defaults() {
        let config: ClientFileConfig = toml::from_str(
            r#"
            domain = "t.example.com"
            key = "11223344556677889900aabbccddeeff11223344556677889900aabbccddeeff"
            "#,
        )
        .unwrap();

        assert_eq!(config.domain, "t.example.com");
        assert_eq!(config.resolvers.len(), 3);
        assert_eq!(config.timeout(), Duration::from_secs(2));
        assert_eq!(config.key.load().unwrap().len(), 32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_config_parses_with_defaults() {
        let config: ServerFileConfig = toml::from_str(
            r#"
            domain = "t.example.com"
            upstream = "https://dns.google/dns-query"
            key = "11223344556677889900aabbccddeeff11223344556677889900aabbccddeeff"
            "#,
        )
        .unwrap();

        assert_eq!(config.mtu, 1232);
        assert_eq!(config.ttl, 60);
        assert_eq!(config.upstream, "https://dns.google/dns-query");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        let config = ClientFileConfig::default();
        assert!(config.validate().is_err());

        let mut config = ServerFileConfig {
            domain: "t.example.com".to_string(),
            ..Default::default()
        };
        config.mtu = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_config_requires_material() {
        let key = KeyConfig::default();
        assert!(key.load().is_err());

        let key = KeyConfig {
            key: Some("not-hex".to_string()),
            key_file: None,
        };
        assert!(key.load().is_err());
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = std::env::temp_dir().join("chapar-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.toml");

        let config = ServerFileConfig {
            domain: "t.example.com".to_string(),
            key: KeyConfig {
                key: Some("ab".repeat(32)),
                key_file: None,
            },
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = ServerFileConfig::from_file(&path).unwrap();
        assert_eq!(loaded.domain, config.domain);
        assert_eq!(loaded.mtu, config.mtu);

        std::fs::remove_file(&path).ok();
    }
}
