//! Configuration management

use crate::client::ClientSettings;
use crate::protocol::{
    CONNECT_TIMEOUT, COPY_BUFFER_SIZE, HANDSHAKE_TIMEOUT, KEEPALIVE_INTERVAL, KEEPALIVE_TIMEOUT,
    INITIAL_WINDOW, MAX_FRAME_SIZE, RECEIVE_BUFFER,
};
use crate::relay::RelayConfig;
use crate::server::ServerSettings;
use crate::tunnel::{Backend, SessionConfig, MAX_PAYLOAD_SIZE};
use crate::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Session multiplexing
    #[serde(default)]
    pub mux: MuxConfig,
    /// Relay tuning
    #[serde(default)]
    pub relay: RelaySettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    pub fn to_toml(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Check values that would otherwise fail after binding
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(server) = &self.server {
            if server.secret.is_empty() {
                return Err(crate::Error::Config("[server] secret must not be empty".into()));
            }
        }
        if let Some(client) = &self.client {
            if client.secret.is_empty() {
                return Err(crate::Error::Config("[client] secret must not be empty".into()));
            }
            if client.local_listen.is_none() && client.socks5_listen.is_none() {
                return Err(crate::Error::Config(
                    "[client] needs local_listen or socks5_listen".into(),
                ));
            }
            if client.socks5_listen.is_some() && client.backend == Backend::Chunked {
                return Err(crate::Error::Config(
                    "[client] socks5_listen needs the direct backend".into(),
                ));
            }
        }
        self.mux.validate()?;
        if self.relay.buffer_size == 0 {
            return Err(crate::Error::Config("[relay] buffer_size must be positive".into()));
        }
        Ok(())
    }

    /// Server runtime settings from the `[server]`, `[mux]` and `[relay]` sections
    pub fn server_settings(&self) -> Result<ServerSettings, crate::Error> {
        let server = self
            .server
            .as_ref()
            .ok_or_else(|| crate::Error::Config("No [server] section in config".into()))?;
        Ok(ServerSettings {
            listen: server.listen.clone(),
            forward: server.forward.clone(),
            secret: server.secret.clone(),
            backend: server.backend,
            handshake_timeout: Duration::from_secs(server.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(server.connect_timeout_secs),
            session: self.mux.session_config(),
            relay: self.relay.relay_config(),
        })
    }

    /// Client runtime settings from the `[client]`, `[mux]` and `[relay]` sections
    pub fn client_settings(&self) -> Result<ClientSettings, crate::Error> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| crate::Error::Config("No [client] section in config".into()))?;
        Ok(ClientSettings {
            server: client.server.clone(),
            secret: client.secret.clone(),
            local_listen: client.local_listen.clone(),
            socks5_listen: client.socks5_listen.clone(),
            backend: client.backend,
            connect_timeout: Duration::from_secs(client.connect_timeout_secs),
            session: self.mux.session_config(),
            relay: self.relay.relay_config(),
        })
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Default forward target
    pub forward: Option<String>,
    /// Shared secret
    pub secret: String,
    /// Multiplexing backend
    pub backend: Backend,
    /// Deadline for the dialer's entropy
    pub handshake_timeout_secs: u64,
    /// Deadline for dialing forward targets
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            forward: Some("127.0.0.1:22".to_string()),
            secret: String::new(),
            backend: Backend::Direct,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Tunnel server address
    pub server: String,
    /// Shared secret
    pub secret: String,
    /// Raw port-forward listener
    pub local_listen: Option<String>,
    /// Local SOCKS5 proxy address
    pub socks5_listen: Option<String>,
    /// Multiplexing backend
    pub backend: Backend,
    /// Deadline for dialing the tunnel server
    pub connect_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", DEFAULT_PORT),
            secret: String::new(),
            local_listen: Some("127.0.0.1:2222".to_string()),
            socks5_listen: Some("127.0.0.1:1080".to_string()),
            backend: Backend::Direct,
            connect_timeout_secs: CONNECT_TIMEOUT.as_secs(),
        }
    }
}

/// Session multiplexing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    /// Largest frame payload in bytes
    pub max_frame_size: usize,
    /// Per-stream receive window in bytes, at least 64 KiB
    pub receive_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: KEEPALIVE_INTERVAL.as_secs(),
            keepalive_timeout_secs: KEEPALIVE_TIMEOUT.as_secs(),
            max_frame_size: MAX_FRAME_SIZE,
            receive_buffer: RECEIVE_BUFFER,
        }
    }
}

impl MuxConfig {
    fn validate(&self) -> Result<(), crate::Error> {
        if self.max_frame_size == 0 || self.max_frame_size > MAX_PAYLOAD_SIZE {
            return Err(crate::Error::Config(format!(
                "[mux] max_frame_size must be between 1 and {}",
                MAX_PAYLOAD_SIZE
            )));
        }
        if self.receive_buffer < INITIAL_WINDOW || self.receive_buffer > u32::MAX as usize {
            return Err(crate::Error::Config(format!(
                "[mux] receive_buffer must be between {} and {}",
                INITIAL_WINDOW,
                u32::MAX
            )));
        }
        if self.keepalive_interval_secs == 0 {
            return Err(crate::Error::Config(
                "[mux] keepalive_interval_secs must be positive".into(),
            ));
        }
        if self.keepalive_timeout_secs < self.keepalive_interval_secs {
            return Err(crate::Error::Config(
                "[mux] keepalive_timeout_secs must not be shorter than the interval".into(),
            ));
        }
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            max_frame_size: self.max_frame_size,
            receive_buffer: self.receive_buffer,
        }
    }
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Copy buffer per direction in bytes
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            buffer_size: COPY_BUFFER_SIZE,
        }
    }
}

impl RelaySettings {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            buffer_size: self.buffer_size,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) -> Result<(), crate::Error> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| crate::Error::Config(format!("Invalid log level '{}': {}", self.level, e)))?;

        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let result = match self.format.as_str() {
            "compact" => builder.compact().try_init(),
            _ => builder.try_init(),
        };
        result.map_err(|e| crate::Error::Config(format!("Failed to install logger: {}", e)))
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig {
            secret: "change-me".to_string(),
            ..ServerConfig::default()
        }),
        client: Some(ClientConfig {
            secret: "change-me".to_string(),
            ..ClientConfig::default()
        }),
        mux: MuxConfig::default(),
        relay: RelaySettings::default(),
        logging: LoggingConfig::default(),
    }
}
