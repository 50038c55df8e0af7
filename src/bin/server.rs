//! Tunnel Server
//!
//! Accepts encrypted tunnel connections and forwards their streams to the
//! configured forward target, or to the destination a stream names.

use anyhow::{Context, Result};
use clap::Parser;
use tcptunnel::config::{generate_example_config, Config};
use tcptunnel::server::TunnelServer;
use tcptunnel::tunnel::Backend;
use tracing::info;

/// Tunnel Server - encrypted TCP forwarding endpoint
#[derive(Parser, Debug)]
#[command(name = "tt-server")]
#[command(about = "Tunnel Server - encrypted TCP forwarding endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Default forward target (overrides config)
    #[arg(short, long)]
    forward: Option<String>,

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

    let server = config.server.get_or_insert_with(Default::default);
    if let Some(listen) = args.listen {
        server.listen = listen;
    }
    if let Some(forward) = args.forward {
        server.forward = Some(forward);
    }
    if let Some(secret) = args.secret {
        server.secret = secret;
    }
    if let Some(backend) = args.backend {
        server.backend = backend;
    }
    config.validate().context("Invalid configuration")?;

    let settings = config.server_settings()?;
    info!("Tunnel Server v{}", tcptunnel::VERSION);
    info!("Backend: {:?}", settings.backend);

    let server = TunnelServer::bind(settings)
        .await
        .context("Failed to bind to address")?;

    tokio::select! {
        result = server.run() => {
            result.context("Server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
