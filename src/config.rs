//! Configuration module for the pooled-tcp server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "pooled-tcp")]
#[command(author = "pooled-tcp authors")]
#[command(version = "0.1.0")]
#[command(about = "A completion-driven TCP connection server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host name or address to listen on (empty means all interfaces)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Port to listen on
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Prefer an IPv6 address when the host name resolves to both families
    #[arg(long)]
    pub prefer_ipv6: bool,

    /// Pending-connection queue length for the listening socket
    #[arg(short = 'b', long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrently served connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Number of connections whose resources are allocated at startup
    #[arg(short = 'i', long)]
    pub initial_resources: Option<usize>,

    /// Size in bytes of each read/write buffer
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// How long an accepted socket waits for a free slot, in milliseconds
    #[arg(long)]
    pub admission_timeout_ms: Option<u64>,

    /// Send timeout for each write, in milliseconds
    #[arg(long)]
    pub send_timeout_ms: Option<u64>,

    /// Receive timeout applied to every connection socket, in milliseconds
    #[arg(long)]
    pub receive_timeout_ms: Option<u64>,

    /// Encoded bytes a connection may queue before its reads pause
    #[arg(long)]
    pub max_outbound_bytes: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Framing protocol
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Wire framing used by the bundled echo service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolType {
    /// `<length>\r\n<payload>` text framing.
    Line,
    /// 4-byte big-endian length prefix.
    LengthPrefixed,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connections: ManagerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub prefer_ipv4: bool,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Number of worker threads
    pub workers: Option<usize>,
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolType,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            prefer_ipv4: true,
            backlog: default_backlog(),
            workers: None,
            protocol: default_protocol(),
        }
    }
}

/// Resource limits and socket timeouts shared by the server and client roles.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Hard upper bound on concurrently open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Connections whose token and handles are built at startup.
    #[serde(default = "default_initial_resources")]
    pub initial_resources: usize,
    /// Bytes per I/O handle buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub receive_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub admission_timeout_ms: u64,
    /// Outbound high-water mark. Reads pause while more than this many
    /// encoded bytes wait to be written, and `send` is refused.
    #[serde(default = "default_max_outbound_bytes")]
    pub max_outbound_bytes: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            initial_resources: default_initial_resources(),
            buffer_size: default_buffer_size(),
            send_timeout_ms: default_timeout_ms(),
            receive_timeout_ms: default_timeout_ms(),
            admission_timeout_ms: default_timeout_ms(),
            max_outbound_bytes: default_max_outbound_bytes(),
        }
    }
}

impl ManagerConfig {
    /// Config with `max_connections` slots, all of them pre-allocated.
    pub fn with_capacity(max_connections: usize) -> Self {
        Self {
            max_connections,
            initial_resources: max_connections,
            ..Self::default()
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Reject limits the engine cannot honor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive".into()));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be positive".into()));
        }
        if self.max_outbound_bytes == 0 {
            return Err(ConfigError::Invalid("max_outbound_bytes must be positive".into()));
        }
        if self.initial_resources > self.max_connections {
            return Err(ConfigError::Invalid(format!(
                "initial_resources ({}) exceeds max_connections ({})",
                self.initial_resources, self.max_connections
            )));
        }
        Ok(())
    }
}

/// Where and how the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Host name or literal address; empty binds the unspecified address.
    pub host: String,
    pub port: u16,
    pub prefer_ipv4: bool,
    pub backlog: u32,
}

impl ListenerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            prefer_ipv4: true,
            backlog: default_backlog(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_true() -> bool {
    true
}

fn default_backlog() -> u32 {
    200
}

fn default_protocol() -> ProtocolType {
    ProtocolType::Line
}

fn default_max_connections() -> usize {
    1024
}

fn default_initial_resources() -> usize {
    64
}

fn default_buffer_size() -> usize {
    8 * 1024
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_outbound_bytes() -> usize {
    256 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub manager: ManagerConfig,
    pub protocol: ProtocolType,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let file = toml_config.connections;
        let manager = ManagerConfig {
            max_connections: cli.max_connections.unwrap_or(file.max_connections),
            initial_resources: cli.initial_resources.unwrap_or(file.initial_resources),
            buffer_size: cli.buffer_size.unwrap_or(file.buffer_size),
            send_timeout_ms: cli.send_timeout_ms.unwrap_or(file.send_timeout_ms),
            receive_timeout_ms: cli.receive_timeout_ms.unwrap_or(file.receive_timeout_ms),
            admission_timeout_ms: cli
                .admission_timeout_ms
                .unwrap_or(file.admission_timeout_ms),
            max_outbound_bytes: cli.max_outbound_bytes.unwrap_or(file.max_outbound_bytes),
        };
        manager.validate()?;

        let server = toml_config.server;
        Ok(Config {
            listener: ListenerConfig {
                host: cli.listen.unwrap_or(server.listen),
                port: cli.port.unwrap_or(server.port),
                prefer_ipv4: server.prefer_ipv4 && !cli.prefer_ipv6,
                backlog: cli.backlog.unwrap_or(server.backlog),
            },
            manager,
            protocol: cli.protocol.unwrap_or(server.protocol),
            workers: cli.workers.or(server.workers),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {1}", path = .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {1}", path = .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
