//! Chapar - Covert DNS Resolver Tunnel
//!
//! Carries encrypted DNS resolution through public recursive resolvers
//! to bypass DoH/DoT blocking and DNS tampering.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use chapar::config::{ClientFileConfig, KeyConfig, ServerFileConfig};
use chapar::{crypto, ClientConfig, ServerConfig, TunnelClient, TunnelServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "chapar")]
#[command(author = "Sina Rabbani")]
#[command(version = VERSION)]
#[command(about = "Covert DNS resolver tunnel", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel client (local DNS listener)
    Client {
        /// Address to listen for DNS queries
        #[arg(short, long, default_value = "127.0.0.1:53")]
        listen: SocketAddr,

        /// Tunnel server domain (e.g. t.example.com)
        #[arg(short, long)]
        domain: Option<String>,

        /// Comma-separated list of public DNS resolvers
        #[arg(short, long, default_value = "8.8.8.8:53,1.1.1.1:53,9.9.9.9:53")]
        resolvers: String,

        /// Encryption key (64 hex characters)
        #[arg(short, long, env = "CHAPAR_KEY")]
        key: Option<String>,

        /// File containing the encryption key
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Query timeout in milliseconds
        #[arg(short, long, default_value = "2000")]
        timeout: u64,
    },

    /// Run the tunnel server (authoritative endpoint)
    Server {
        /// UDP address to listen on
        #[arg(short, long, default_value = "0.0.0.0:53")]
        listen: SocketAddr,

        /// Domain this server is authoritative for (e.g. t.example.com)
        #[arg(short, long)]
        domain: Option<String>,

        /// Upstream resolver (UDP: 8.8.8.8:53, DoH: https://dns.google/dns-query, DoT: dns.google:853)
        #[arg(short, long, default_value = "8.8.8.8:53")]
        upstream: String,

        /// Encryption key (64 hex characters)
        #[arg(short, long, env = "CHAPAR_KEY")]
        key: Option<String>,

        /// File containing the encryption key
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Maximum UDP payload size before truncation
        #[arg(long, default_value = "1232")]
        mtu: usize,

        /// Response TTL in seconds
        #[arg(long, default_value = "60")]
        ttl: u32,

        /// Per-IP rate limit (queries per second)
        #[arg(long, default_value = "100")]
        rate_limit: u32,
    },

    /// Generate a new encryption key
    Genkey,

    /// Generate configuration files
    Genconf {
        /// Save client config to file
        #[arg(long)]
        client_config: Option<PathBuf>,

        /// Save server config to file
        #[arg(long)]
        server_config: Option<PathBuf>,

        /// Tunnel domain for the generated configs
        #[arg(long, default_value = "t.example.com")]
        domain: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger with multiple verbosity levels
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();

    if cli.verbose >= 4 {
        // Maximum verbosity: trace everything including dependencies
        logger.filter_level(log::LevelFilter::Trace);
    } else if cli.verbose >= 3 {
        // Trace for our crate only, debug for others
        logger.filter_module("chapar", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }

    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();

    log::debug!("chapar {} ({}) built {}", VERSION, GIT_HASH, BUILD_DATE);

    match cli.command {
        Commands::Client {
            listen,
            domain,
            resolvers,
            key,
            key_file,
            timeout,
        } => {
            run_client(
                cli.config, listen, domain, resolvers, key, key_file, timeout,
            )
            .await
        }

        Commands::Server {
            listen,
            domain,
            upstream,
            key,
            key_file,
            mtu,
            ttl,
            rate_limit,
        } => {
            run_server(
                cli.config, listen, domain, upstream, key, key_file, mtu, ttl, rate_limit,
            )
            .await
        }

        Commands::Genkey => {
            let key = crypto::generate_key().context("failed to generate key")?;
            println!("Generated encryption key:\n{}", crypto::format_hex_key(&key));
            println!("\nSave this key securely and use it on both client and server.");
            Ok(())
        }

        Commands::Genconf {
            client_config,
            server_config,
            domain,
        } => generate_configs(client_config, server_config, &domain),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    config_path: Option<PathBuf>,
    listen: SocketAddr,
    domain: Option<String>,
    resolvers: String,
    key: Option<String>,
    key_file: Option<PathBuf>,
    timeout: u64,
) -> Result<()> {
    let file_config = match config_path {
        Some(path) => Some(ClientFileConfig::from_file(&path)?),
        None => None,
    };

    let domain = domain
        .or_else(|| file_config.as_ref().map(|c| c.domain.clone()))
        .unwrap_or_default();
    if domain.is_empty() {
        bail!("server domain is required (--domain)");
    }

    let shared_secret = load_key(key, key_file, file_config.as_ref().map(|c| &c.key))?;

    let resolvers: Vec<String> = resolvers
        .split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();

    let config = ClientConfig {
        listen_addr: listen,
        server_domain: domain,
        resolvers,
        shared_secret,
        timeout: Duration::from_millis(timeout),
        ..Default::default()
    };

    let mut client = TunnelClient::new(config).context("failed to create client")?;
    client.start().await.context("failed to start client")?;
    log::info!("DNS tunnel client started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    log::info!("received interrupt, shutting down");

    client.stop().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    config_path: Option<PathBuf>,
    listen: SocketAddr,
    domain: Option<String>,
    upstream: String,
    key: Option<String>,
    key_file: Option<PathBuf>,
    mtu: usize,
    ttl: u32,
    rate_limit: u32,
) -> Result<()> {
    let file_config = match config_path {
        Some(path) => Some(ServerFileConfig::from_file(&path)?),
        None => None,
    };

    let domain = domain
        .or_else(|| file_config.as_ref().map(|c| c.domain.clone()))
        .unwrap_or_default();
    if domain.is_empty() {
        bail!("domain is required (--domain)");
    }

    let shared_secret = load_key(key, key_file, file_config.as_ref().map(|c| &c.key))?;

    let config = ServerConfig {
        listen_addr: listen,
        domain,
        shared_secret,
        upstream,
        max_udp_size: mtu,
        response_ttl: ttl,
        rate_limit,
        ..Default::default()
    };

    let mut server = TunnelServer::new(config).context("failed to create server")?;
    server.start().await.context("failed to start server")?;
    log::info!("DNS tunnel server started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    log::info!("received interrupt, shutting down");

    server.stop().await;
    Ok(())
}

/// Key resolution order: --key, --key-file, then the config file.
fn load_key(
    key: Option<String>,
    key_file: Option<PathBuf>,
    file_key: Option<&KeyConfig>,
) -> Result<Vec<u8>> {
    let direct = KeyConfig { key, key_file };
    if direct.key.is_some() || direct.key_file.is_some() {
        return direct.load();
    }
    if let Some(file_key) = file_key {
        return file_key.load();
    }
    bail!("encryption key is required (--key or --key-file)");
}

fn generate_configs(
    client_path: Option<PathBuf>,
    server_path: Option<PathBuf>,
    domain: &str,
) -> Result<()> {
    let key = crypto::generate_key().context("failed to generate key")?;
    let key_hex = crypto::format_hex_key(&key);

    if let Some(path) = &client_path {
        let config = ClientFileConfig {
            domain: domain.to_string(),
            key: KeyConfig {
                key: Some(key_hex.clone()),
                key_file: None,
            },
            ..Default::default()
        };
        config.to_file(path)?;
        println!("Client config written to {}", path.display());
    }

    if let Some(path) = &server_path {
        let config = ServerFileConfig {
            domain: domain.to_string(),
            key: KeyConfig {
                key: Some(key_hex.clone()),
                key_file: None,
            },
            ..Default::default()
        };
        config.to_file(path)?;
        println!("Server config written to {}", path.display());
    }

    if client_path.is_none() && server_path.is_none() {
        println!("Nothing to do: pass --client-config and/or --server-config");
        println!("Generated key (unused): {}", key_hex);
    } else {
        println!("\nDNS zone setup:");
        println!("  A   tns.{:<20} -> <server-ip>", trim_tunnel_label(domain));
        println!("  NS  {:<24} -> tns.{}", domain, trim_tunnel_label(domain));
    }

    Ok(())
}

/// `t.example.com` -> `example.com` for the zone-setup hint.
fn trim_tunnel_label(domain: &str) -> &str {
    domain.split_once('.').map(|(_, rest)| rest).unwrap_or(domain)
}
