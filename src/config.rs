//! Configuration module for the graceful-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo server
#[derive(Parser, Debug, Default)]
#[command(name = "graceful-echo")]
#[command(author = "graceful-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded echo server with graceful shutdown", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of simultaneous connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Upper bound on a single poll wait, in milliseconds
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Bytes read from a connection per read call
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Largest message accepted, terminator included; longer ones close the connection
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Keep echoing messages (multi) or close after the first echo (single-shot)
    #[arg(long, value_enum)]
    pub session_mode: Option<SessionMode>,

    /// Time allowed for open sessions to finish after a shutdown signal, in milliseconds
    #[arg(long)]
    pub drain_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// How many messages a session serves before closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    /// Echo every framed message until the peer closes.
    #[default]
    Multi,
    /// Close after the first echo.
    SingleShot,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

/// Per-connection session configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default)]
    pub mode: SessionMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: default_read_chunk_size(),
            max_message_size: default_max_message_size(),
            mode: SessionMode::default(),
        }
    }
}

/// Shutdown configuration
#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
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
    "127.0.0.1:8000".to_string()
}

fn default_backlog() -> u32 {
    1024
}

fn default_max_connections() -> usize {
    10_000
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_read_chunk_size() -> usize {
    1024
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_drain_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub max_connections: usize,
    pub poll_timeout: Duration,
    pub read_chunk_size: usize,
    pub max_message_size: usize,
    pub session_mode: SessionMode,
    pub drain_timeout: Duration,
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

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::Invalid("listen", format!("'{listen}' is not a socket address")))?;

        let config = Config {
            listen,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            poll_timeout: Duration::from_millis(
                cli.poll_timeout_ms
                    .unwrap_or(toml_config.server.poll_timeout_ms),
            ),
            read_chunk_size: cli
                .read_chunk_size
                .unwrap_or(toml_config.session.read_chunk_size),
            max_message_size: cli
                .max_message_size
                .unwrap_or(toml_config.session.max_message_size),
            session_mode: cli.session_mode.unwrap_or(toml_config.session.mode),
            drain_timeout: Duration::from_millis(
                cli.drain_timeout_ms
                    .unwrap_or(toml_config.shutdown.drain_timeout_ms),
            ),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::Invalid("backlog", "must be non-zero".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections", "must be non-zero".into()));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::Invalid("poll_timeout_ms", "must be non-zero".into()));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid("read_chunk_size", "must be non-zero".into()));
        }
        if self.max_message_size < 2 {
            return Err(ConfigError::Invalid(
                "max_message_size",
                "must leave room for the \\r\\n terminator".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid value for '{0}': {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.read_chunk_size, 1024);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.session_mode, SessionMode::Multi);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            max_connections = 4

            [session]
            read_chunk_size = 2
            mode = "single-shot"

            [shutdown]
            drain_timeout_ms = 500

            [logging]
            level = "debug"
        "#;

        let toml_config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(toml_config.server.backlog, 1024);

        let config = Config::merge(CliArgs::default(), toml_config).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.read_chunk_size, 2);
        assert_eq!(config.session_mode, SessionMode::SingleShot);
        assert_eq!(config.drain_timeout, Duration::from_millis(500));
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"

            [logging]
            level = "debug"
        "#,
        )
        .unwrap();

        let cli = CliArgs::try_parse_from([
            "graceful-echo",
            "--listen",
            "127.0.0.1:7000",
            "--session-mode",
            "single-shot",
        ])
        .unwrap();

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.session_mode, SessionMode::SingleShot);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_invalid_values() {
        let cli = CliArgs {
            listen: Some("not-an-address".into()),
            ..Default::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid("listen", _))
        ));

        let cli = CliArgs {
            read_chunk_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid("read_chunk_size", _))
        ));

        let cli = CliArgs {
            max_message_size: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid("max_message_size", _))
        ));
    }
}
