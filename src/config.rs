//! Configuration for the enet server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over the built-in defaults.

use crate::runtime::ExhaustionPolicy;
use clap::Parser;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "enet-server")]
#[command(version = "0.1.0")]
#[command(about = "A minimal rate-limited TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum concurrently served connections (also the listen backlog)
    #[arg(short = 'n', long)]
    pub max_connections: Option<usize>,

    /// Size of each pooled receive buffer in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of pooled receive buffers (unbounded when unset)
    #[arg(long)]
    pub max_buffers: Option<usize>,

    /// What to do when the buffer pool is exhausted
    #[arg(long, value_enum)]
    pub buffer_policy: Option<ExhaustionPolicy>,

    /// Bytes an endpoint may send within one rate window
    #[arg(long)]
    pub rate_limit: Option<u64>,

    /// Rate window length in seconds
    #[arg(long)]
    pub rate_window: Option<u64>,

    /// Seconds an idle pooled connection is kept before eviction
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub buffers: BufferSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub connections: ConnectionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    pub workers: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Receive buffer pool configuration
#[derive(Debug, Deserialize)]
pub struct BufferSection {
    /// Size of each buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub size: usize,
    /// Upper bound on pooled buffers
    pub max_count: Option<usize>,
    #[serde(default)]
    pub policy: ExhaustionPolicy,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            size: default_buffer_size(),
            max_count: None,
            policy: ExhaustionPolicy::default(),
        }
    }
}

/// Per-endpoint rate limiting configuration
#[derive(Debug, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_rate_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_rate_limit")]
    pub max_bytes: u64,
    /// Windows older than this many window lengths are swept
    #[serde(default = "default_retention_windows")]
    pub retention_windows: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_secs: default_rate_window_secs(),
            max_bytes: default_rate_limit(),
            retention_windows: default_retention_windows(),
        }
    }
}

/// Connection pool configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionSection {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_housekeeping_secs")]
    pub housekeeping_interval_secs: u64,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            housekeeping_interval_secs: default_housekeeping_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_max_connections() -> usize {
    10
}

fn default_buffer_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_rate_window_secs() -> u64 {
    5 * 60
}

fn default_rate_limit() -> u64 {
    10 * 1024 * 1024 // 10 MiB
}

fn default_retention_windows() -> u32 {
    2
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_housekeeping_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration consumed by [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Cap on concurrently served connections; also the listen backlog.
    pub max_connections: usize,
    pub buffer_size: usize,
    pub max_buffers: Option<usize>,
    pub buffer_policy: ExhaustionPolicy,
    pub rate_window: Duration,
    pub rate_limit: u64,
    pub rate_retention_windows: u32,
    pub idle_timeout: Duration,
    pub housekeeping_interval: Duration,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args over TOML values (CLI takes precedence).
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.buffers.size),
            max_buffers: cli.max_buffers.or(toml_config.buffers.max_count),
            buffer_policy: cli.buffer_policy.unwrap_or(toml_config.buffers.policy),
            rate_window: Duration::from_secs(
                cli.rate_window
                    .unwrap_or(toml_config.rate_limit.window_secs),
            ),
            rate_limit: cli.rate_limit.unwrap_or(toml_config.rate_limit.max_bytes),
            rate_retention_windows: toml_config.rate_limit.retention_windows,
            idle_timeout: Duration::from_secs(
                cli.idle_timeout
                    .unwrap_or(toml_config.connections.idle_timeout_secs),
            ),
            housekeeping_interval: Duration::from_secs(
                toml_config.connections.housekeeping_interval_secs,
            ),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer size must be at least 1 byte"));
        }
        if self.max_buffers == Some(0) {
            return Err(ConfigError::Invalid("max_buffers must be at least 1"));
        }
        if self.rate_window.is_zero() {
            return Err(ConfigError::Invalid("rate window must be non-zero"));
        }
        if self.rate_retention_windows == 0 {
            return Err(ConfigError::Invalid("retention_windows must be at least 1"));
        }
        if self.housekeeping_interval.is_zero() {
            return Err(ConfigError::Invalid("housekeeping interval must be non-zero"));
        }
        Ok(())
    }

    /// Resolve `host:port` to the socket address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(self.host.clone(), e))?
            .next()
            .ok_or_else(|| {
                ConfigError::Resolve(
                    self.host.clone(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
                )
            })
    }

    /// Rate windows untouched for this long are dropped by housekeeping.
    pub fn rate_retention(&self) -> Duration {
        self.rate_window.saturating_mul(self.rate_retention_windows)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("failed to resolve host '{0}': {1}")]
    Resolve(String, #[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}
