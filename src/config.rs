//! Configuration module for the serversim server.
//!
//! The listening port always comes from the `TCP_SERVER_PORT` environment
//! variable. Everything else can be tuned with command-line arguments or a
//! TOML configuration file; CLI arguments take precedence over file values.

use crate::exit::ExitStatus;
use clap::Parser;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the listening port.
pub const PORT_ENV: &str = "TCP_SERVER_PORT";

/// Command-line arguments for the server
#[derive(Parser, Debug, Default)]
#[command(name = "serversim")]
#[command(author = "serversim authors")]
#[command(version = "0.1.0")]
#[command(
    about = "A TCP test server that answers one line-based command per connection",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (the port comes from TCP_SERVER_PORT)
    #[arg(short, long)]
    pub bind: Option<IpAddr>,

    /// Depth of the kernel accept queue
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrently executing request handlers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// How long a worker waits for a request before dropping the connection (0 disables)
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

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
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and event loop configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Upper bound on one poll call; the shutdown flag is checked at least this often
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_linger_secs")]
    pub linger_secs: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Maximum readiness events drained per poll call
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            backlog: default_backlog(),
            poll_timeout_ms: default_poll_timeout_ms(),
            linger_secs: default_linger_secs(),
            read_timeout_ms: default_read_timeout_ms(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
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

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_backlog() -> u32 {
    1024
}

fn default_poll_timeout_ms() -> u64 {
    200
}

// Non-zero: a zero linger turns every close into a reset.
fn default_linger_secs() -> u64 {
    60
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    128
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where and how the listening socket is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerEndpoint {
    pub addr: SocketAddr,
    pub backlog: u32,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub backlog: u32,
    pub workers: usize,
    pub poll_timeout: Duration,
    pub linger: Duration,
    pub read_timeout: Duration,
    pub events_capacity: usize,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the environment, CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        let port = parse_port(std::env::var(PORT_ENV).ok().as_deref())?;

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Ok(Self::merge(port, cli, toml_config))
    }

    /// Merge CLI args over TOML values. CLI takes precedence.
    pub fn merge(port: u16, cli: CliArgs, toml_config: TomlConfig) -> Self {
        let server = toml_config.server;
        Config {
            bind: cli.bind.unwrap_or(server.bind),
            port,
            backlog: cli.backlog.unwrap_or(server.backlog),
            workers: cli.workers.unwrap_or(toml_config.pool.workers).max(1),
            poll_timeout: Duration::from_millis(server.poll_timeout_ms),
            linger: Duration::from_secs(server.linger_secs),
            read_timeout: Duration::from_millis(
                cli.read_timeout_ms.unwrap_or(server.read_timeout_ms),
            ),
            events_capacity: server.events_capacity.max(1),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    pub fn listener_endpoint(&self) -> ListenerEndpoint {
        ListenerEndpoint {
            addr: SocketAddr::new(self.bind, self.port),
            backlog: self.backlog,
        }
    }
}

/// Validate the raw `TCP_SERVER_PORT` value.
pub fn parse_port(raw: Option<&str>) -> Result<u16, ConfigError> {
    let raw = raw.ok_or(ConfigError::MissingPort)?;
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort(raw.to_string())),
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable TCP_SERVER_PORT was not set")]
    MissingPort,

    #[error("Environment variable TCP_SERVER_PORT is not numeric [{0}]")]
    InvalidPort(String),

    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            ConfigError::MissingPort => ExitStatus::MissingPort,
            ConfigError::InvalidPort(_) => ExitStatus::InvalidPort,
            ConfigError::FileRead { .. } | ConfigError::TomlParse { .. } => ExitStatus::BadConfigFile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(9999, CliArgs::default(), TomlConfig::default());
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.workers, 128);
        assert_eq!(config.poll_timeout, Duration::from_millis(200));
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.listener_endpoint().addr,
            "0.0.0.0:9999".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            bind = "127.0.0.1"
            backlog = 16
            poll_timeout_ms = 50

            [pool]
            workers = 4

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.server.backlog, 16);
        assert_eq!(config.server.poll_timeout_ms, 50);
        assert_eq!(config.server.linger_secs, 60);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str("[pool]\nworkers = 4\n").unwrap();
        let cli = CliArgs {
            workers: Some(8),
            log_level: Some("warn".to_string()),
            ..CliArgs::default()
        };

        let config = Config::merge(1, cli, toml_config);
        assert_eq!(config.workers, 8);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port(Some("8080")).unwrap(), 8080);

        let missing = parse_port(None).unwrap_err();
        assert!(matches!(missing, ConfigError::MissingPort));
        assert_eq!(missing.exit_status(), ExitStatus::MissingPort);

        for bad in ["abc", "", "0", "-1", "70000", "12.5"] {
            let err = parse_port(Some(bad)).unwrap_err();
            assert_eq!(err.exit_status(), ExitStatus::InvalidPort, "input {bad:?}");
        }
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConfigError::InvalidPort("abc".into()).to_string(),
            "Environment variable TCP_SERVER_PORT is not numeric [abc]"
        );
        assert_eq!(
            ConfigError::MissingPort.to_string(),
            "Environment variable TCP_SERVER_PORT was not set"
        );
    }
}
