//! Forwarder configuration, its persisted store and the hot-swappable handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::DeviceIdentity;

/// Forwarder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Partner gateway endpoint; the command goes in its `cmd` query parameter.
    #[serde(default)]
    pub target_url: String,

    /// Forward each record as soon as it is stored.
    #[serde(default = "default_true")]
    pub realtime: bool,

    /// Run the catch-up scheduler.
    #[serde(default = "default_true")]
    pub auto_forward: bool,

    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Records per catch-up cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Only these identities are forwarded. Empty means all.
    #[serde(default)]
    pub identity_filter: Vec<DeviceIdentity>,

    /// Appended to the device identity in the outbound command.
    #[serde(default = "default_identity_suffix")]
    pub identity_suffix: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Decimal places for the speed field, in knots.
    #[serde(default = "default_speed_precision")]
    pub speed_precision: usize,
}

fn default_true() -> bool {
    true
}
fn default_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_batch_size() -> usize {
    100
}
fn default_identity_suffix() -> String {
    "F".to_string()
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_speed_precision() -> usize {
    4
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_url: String::new(),
            realtime: default_true(),
            auto_forward: default_true(),
            interval: default_interval(),
            batch_size: default_batch_size(),
            identity_filter: Vec::new(),
            identity_suffix: default_identity_suffix(),
            request_timeout: default_request_timeout(),
            speed_precision: default_speed_precision(),
        }
    }
}

impl ForwarderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled {
            reqwest::Url::parse(&self.target_url).map_err(|e| {
                Error::InvalidConfig(format!(
                    "forwarder.target_url {:?}: {e}",
                    self.target_url
                ))
            })?;
        }
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig(
                "forwarder.interval must be non-zero".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "forwarder.batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Whether records from `identity` pass the allow-list.
    pub fn allows(&self, identity: Option<&DeviceIdentity>) -> bool {
        if self.identity_filter.is_empty() {
            return true;
        }
        identity.is_some_and(|id| self.identity_filter.contains(id))
    }

    /// The allow-list in the form storage queries take.
    pub fn filter(&self) -> Option<&[DeviceIdentity]> {
        if self.identity_filter.is_empty() {
            None
        } else {
            Some(&self.identity_filter)
        }
    }
}

/// One published configuration value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub config: ForwarderConfig,
}

/// Versioned forwarder configuration, replaced only as a whole value.
#[derive(Clone)]
pub struct ForwarderConfigHandle {
    tx: Arc<watch::Sender<Arc<ConfigSnapshot>>>,
}

impl ForwarderConfigHandle {
    pub fn new(config: ForwarderConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(ConfigSnapshot { version: 1, config }));
        Self { tx: Arc::new(tx) }
    }

    /// The current value.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigSnapshot>> {
        self.tx.subscribe()
    }

    /// Validate and publish a new value. Returns its version.
    pub fn replace(&self, config: ForwarderConfig) -> Result<u64> {
        config.validate()?;
        let mut version = 0;
        // Read and bump under the channel's write lock
        self.tx.send_modify(|current| {
            version = current.version + 1;
            *current = Arc::new(ConfigSnapshot { version, config });
        });
        info!(version, "Forwarder configuration updated");
        Ok(version)
    }

    /// Reload from a store and publish the result.
    pub async fn reload(&self, store: &dyn ForwarderConfigStore) -> Result<u64> {
        let config = store.get().await?;
        self.replace(config)
    }

    /// Persist to a store, then publish.
    pub async fn update(&self, store: &dyn ForwarderConfigStore, config: ForwarderConfig) -> Result<u64> {
        config.validate()?;
        store.update(&config).await?;
        self.replace(config)
    }
}

/// Externally persisted forwarder configuration.
#[async_trait]
pub trait ForwarderConfigStore: Send + Sync {
    async fn get(&self) -> Result<ForwarderConfig>;
    async fn update(&self, config: &ForwarderConfig) -> Result<()>;
}

/// TOML file store.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ForwarderConfigStore for FileConfigStore {
    async fn get(&self) -> Result<ForwarderConfig> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("failed to parse {}: {e}", self.path.display()))
        })
    }

    async fn update(&self, config: &ForwarderConfig) -> Result<()> {
        let content = toml::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("failed to serialize forwarder config: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial file
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
