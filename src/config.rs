//! Configuration module for the line-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime backend used to serve connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Non-blocking mio event loop, one session state machine per connection.
    EventLoop,
    /// One client at a time, one exchange per connection.
    Blocking,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "line-echo")]
#[command(author = "line-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP echo server", long_about = None)]
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

    /// Runtime backend
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of event loop workers
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum buffered bytes without a newline before a session is closed
    #[arg(long)]
    pub max_line: Option<usize>,

    /// Idle timeout in milliseconds
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listen backlog passed to `listen(2)`
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum readiness events drained per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            runtime: default_runtime(),
            workers: default_workers(),
            backlog: default_backlog(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_line")]
    pub max_line: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_line: default_max_line(),
            idle_timeout_ms: default_idle_timeout_ms(),
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

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5555
}

fn default_runtime() -> RuntimeType {
    RuntimeType::EventLoop
}

fn default_workers() -> usize {
    1
}

fn default_backlog() -> i32 {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_max_line() -> usize {
    64 * 1024 // 64 KiB
}

fn default_idle_timeout_ms() -> u64 {
    15_000 // 15 seconds
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub runtime: RuntimeType,
    pub workers: usize,
    pub backlog: i32,
    pub events_capacity: usize,
    pub max_line: usize,
    pub idle_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::empty(), TomlConfig::default())
    }
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            runtime: cli.runtime.unwrap_or(toml_config.server.runtime),
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            backlog: toml_config.server.backlog,
            events_capacity: toml_config.server.events_capacity,
            max_line: cli.max_line.unwrap_or(toml_config.session.max_line),
            idle_timeout: Duration::from_millis(
                cli.idle_timeout_ms
                    .unwrap_or(toml_config.session.idle_timeout_ms),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.max_line == 0 {
            return Err(ConfigError::Invalid("max_line must be at least 1"));
        }
        if self.events_capacity == 0 {
            return Err(ConfigError::Invalid("events_capacity must be at least 1"));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid("idle_timeout_ms must be at least 1"));
        }
        Ok(())
    }

    /// Resolve `host:port` to the first usable socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let endpoint = format!("{}:{}", self.host, self.port);
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ConfigError::Resolve(endpoint.clone(), Some(e)))?
            .next()
            .ok_or(ConfigError::Resolve(endpoint, None))
    }
}

impl CliArgs {
    fn empty() -> Self {
        CliArgs {
            config: None,
            host: None,
            port: None,
            runtime: None,
            workers: None,
            max_line: None,
            idle_timeout_ms: None,
            log_level: None,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Resolve(String, Option<std::io::Error>),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Resolve(endpoint, Some(e)) => {
                write!(f, "Failed to resolve '{}': {}", endpoint, e)
            }
            ConfigError::Resolve(endpoint, None) => {
                write!(f, "No addresses found for '{}'", endpoint)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
