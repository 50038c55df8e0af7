//! Tunnel Client
//!
//! Local raw port forward and SOCKS5 proxy, both carried to the tunnel
//! server over an encrypted channel.

use anyhow::{Context, Result};
use clap::Parser;
use tcptunnel::client::TunnelClient;
use tcptunnel::config::{generate_example_config, Config};
use tcptunnel::tunnel::Backend;
use tracing::info;

/// Tunnel Client - local forward and SOCKS5 over an encrypted tunnel
#[derive(Parser, Debug)]
#[command(name = "tt-client")]
#[command(about = "Tunnel Client - local forward and SOCKS5 over an encrypted tunnel")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Tunnel server address (overrides config)
    #[arg(long)]
    server: Option<String>,

    /// Raw forward listen address (overrides config)
    #[arg(short, long)]
    local: Option<String>,

    /// SOCKS5 listen address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Shared secret (overrides config)
    #[arg(short, long)]
    secret: Option<String>,

    /// Multiplexing backend (overrides config)
    #[arg(short, long, value_parser = parse_backend)]
    backend: Option<Backend>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

fn parse_backend(s: &str) -> Result<Backend, String> {
    match s {
        "direct" => Ok(Backend::Direct),
        "chunked" => Ok(Backend::Chunked),
        other => Err(format!("unknown backend '{}', expected direct or chunked", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        print!("{}", generate_example_config().to_toml()?);
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.init()?;

    let client = config.client.get_or_insert_with(Default::default);
    if let Some(server) = args.server {
        client.server = server;
    }
    if let Some(local) = args.local {
        client.local_listen = Some(local);
    }
    if let Some(socks5) = args.socks5 {
        client.socks5_listen = Some(socks5);
    }
    if let Some(secret) = args.secret {
        client.secret = secret;
    }
    if let Some(backend) = args.backend {
        client.backend = backend;
    }
    config.validate().context("Invalid configuration")?;

    let settings = config.client_settings()?;
    info!("Tunnel Client v{}", tcptunnel::VERSION);
    info!("Server: {} ({:?} backend)", settings.server, settings.backend);

    let client = TunnelClient::bind(&settings)
        .await
        .context("Failed to bind local listeners")?;
    if let Some(addr) = client.forward_addr() {
        info!("Forwarding {} through the tunnel", addr);
    }
    if let Some(addr) = client.socks5_addr() {
        info!("SOCKS5 proxy on {}", addr);
    }

    tokio::select! {
        result = client.run() => {
            result.context("Client stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
