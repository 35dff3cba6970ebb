//! Configuration management for gnss-relay.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::forwarder::ForwarderConfig;
use crate::metrics::MetricsConfig;
use crate::protocol::{ChecksumPolicy, MAX_PAYLOAD_SIZE};
use crate::queue::QueueConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Device listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Ingestion queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Initial forwarder configuration. Replaced by the contents of
    /// `server.forwarder_config_path` when that file exists.
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen_addrs.is_empty() {
            return Err(Error::InvalidConfig("No listen addresses configured".into()));
        }

        if self.server.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "server.max_connections must be at least 1".into(),
            ));
        }

        if self.server.max_frame_payload == 0 || self.server.max_frame_payload > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidConfig(format!(
                "server.max_frame_payload must be between 1 and {MAX_PAYLOAD_SIZE}"
            )));
        }

        if self.metrics.enabled {
            self.metrics.http_bind.parse::<SocketAddr>().map_err(|e| {
                Error::InvalidConfig(format!("metrics.http_bind {:?}: {e}", self.metrics.http_bind))
            })?;
        }

        self.queue.validate()?;
        self.forwarder.validate()?;

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "gnss-relay", "gnss-relay").map_or_else(
            || PathBuf::from("gnss-relay.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                listen_addrs: vec![
                    SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT)),
                    SocketAddr::from(([0u16; 8], crate::DEFAULT_PORT)),
                ],
                forwarder_config_path: Some(PathBuf::from("/etc/gnss-relay/forwarder.toml")),
                forward_log_path: Some(PathBuf::from("/var/lib/gnss-relay/forward.jsonl")),
                ..Default::default()
            },
            forwarder: ForwarderConfig {
                enabled: true,
                target_url: "http://gateway.example.com/cmd".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Device listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen addresses.
    #[serde(default = "default_listen_addrs")]
    pub listen_addrs: Vec<SocketAddr>,

    /// Maximum concurrent device connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Close a connection after this long without a byte.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Largest declared payload accepted before the connection is closed.
    #[serde(default = "default_max_frame_payload")]
    pub max_frame_payload: usize,

    #[serde(default)]
    pub checksum_policy: ChecksumPolicy,

    /// Upper bound on draining the queue at shutdown.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Persisted forwarder configuration, reloaded on SIGHUP.
    #[serde(default)]
    pub forwarder_config_path: Option<PathBuf>,

    /// JSON-lines forward audit log. In-memory when unset.
    #[serde(default)]
    pub forward_log_path: Option<PathBuf>,
}

fn default_listen_addrs() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_PORT))]
}
fn default_max_connections() -> usize {
    10000
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_max_frame_payload() -> usize {
    8192
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addrs: default_listen_addrs(),
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            max_frame_payload: default_max_frame_payload(),
            checksum_policy: ChecksumPolicy::default(),
            shutdown_grace: default_shutdown_grace(),
            forwarder_config_path: None,
            forward_log_path: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}
