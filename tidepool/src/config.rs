//! File-based runtime configuration.
//!
//! ```toml
//! [eviction]
//! idle_timeout_ms = 70000
//! empty_idle_timeout_ms = 10000
//!
//! [alarms]
//! max_retries = 6
//! initial_backoff_ms = 2000
//!
//! [storage]
//! kind = "file"
//! path = "/var/lib/tidepool/default"
//!
//! [[regions]]
//! jurisdiction = "eu"
//! kind = "file"
//! path = "/var/lib/tidepool/eu"
//!
//! [[bindings]]
//! namespace = "COUNTER"
//! class = "Counter"
//! ```
//!
//! Every section is optional. Bindings name classes that must be registered
//! on the [`RuntimeBuilder`](crate::RuntimeBuilder) before `build()`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Error};
use crate::object::Jurisdiction;
use crate::router::{AlarmPolicy, EvictionPolicy};
use crate::storage::{FileBackend, MemoryBackend, StorageBackend};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Idle eviction timeouts.
    pub eviction: EvictionConfig,
    /// Alarm retry schedule.
    pub alarms: AlarmConfig,
    /// Default storage region.
    pub storage: StorageConfig,
    /// Jurisdiction-specific storage regions.
    pub regions: Vec<RegionConfig>,
    /// Namespace bindings.
    pub bindings: Vec<BindingConfig>,
}

impl RuntimeConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse the TOML file at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(
            path = %path.display(),
            bindings = config.bindings.len(),
            regions = config.regions.len(),
            "loaded runtime config"
        );
        Ok(config)
    }
}

/// `[eviction]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Idle time before evicting an object with stored keys.
    pub idle_timeout_ms: u64,
    /// Idle time before evicting an object with empty storage.
    pub empty_idle_timeout_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        let policy = EvictionPolicy::default();
        Self {
            idle_timeout_ms: policy.idle_timeout.as_millis() as u64,
            empty_idle_timeout_ms: policy.empty_idle_timeout.as_millis() as u64,
        }
    }
}

impl From<EvictionConfig> for EvictionPolicy {
    fn from(config: EvictionConfig) -> Self {
        EvictionPolicy::new(
            Duration::from_millis(config.idle_timeout_ms),
            Duration::from_millis(config.empty_idle_timeout_ms),
        )
    }
}

/// `[alarms]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Retries after a failed alarm handler.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff_ms: u64,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        let policy = AlarmPolicy::default();
        Self {
            max_retries: policy.max_retries,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
        }
    }
}

impl From<AlarmConfig> for AlarmPolicy {
    fn from(config: AlarmConfig) -> Self {
        AlarmPolicy {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
        }
    }
}

/// Kind of storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// [`MemoryBackend`].
    #[default]
    Memory,
    /// [`FileBackend`], requires `path`.
    File,
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind.
    pub kind: StorageKind,
    /// Root directory for file storage.
    pub path: Option<PathBuf>,
}

impl StorageConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> Result<Arc<dyn StorageBackend>, Error> {
        open_backend(self.kind, self.path.as_deref()).await
    }
}

/// One `[[regions]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegionConfig {
    /// Jurisdiction served by this region.
    pub jurisdiction: Jurisdiction,
    /// Backend kind.
    #[serde(default)]
    pub kind: StorageKind,
    /// Root directory for file storage.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl RegionConfig {
    /// Open the configured backend.
    pub async fn open(&self) -> Result<Arc<dyn StorageBackend>, Error> {
        open_backend(self.kind, self.path.as_deref()).await
    }
}

/// One `[[bindings]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingConfig {
    /// Namespace name.
    pub namespace: String,
    /// Class registered with [`RuntimeBuilder::class`](crate::RuntimeBuilder::class).
    pub class: String,
    /// Restrict every id of the namespace to this jurisdiction.
    #[serde(default)]
    pub jurisdiction: Option<Jurisdiction>,
}

async fn open_backend(
    kind: StorageKind,
    path: Option<&Path>,
) -> Result<Arc<dyn StorageBackend>, Error> {
    match kind {
        StorageKind::Memory => Ok(Arc::new(MemoryBackend::new())),
        StorageKind::File => {
            let path = path.ok_or(ConfigError::MissingPath)?;
            Ok(Arc::new(FileBackend::open(path).await?))
        }
    }
}
