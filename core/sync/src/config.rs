//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use fieldsync_common::{Error, Result};

use crate::orchestrator::SyncConfig;
use crate::scheduler::SyncMode;

/// Database file name inside the data directory.
pub const DATABASE_FILENAME: &str = "fieldsync.db";

/// Configuration file name inside the data directory.
pub const CONFIG_FILENAME: &str = "config.json";

/// Application directory name under the platform data directory.
pub const APP_DIRNAME: &str = "fieldsync";

/// Everything needed to assemble a store, a monitor and an orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database location.
    pub database_path: PathBuf,
    /// Base URL records are submitted to. Sync is unavailable without one.
    #[serde(default)]
    pub endpoint: Option<Url>,
    /// URL probed for reachability. Defaults to the endpoint.
    #[serde(default)]
    pub probe_url: Option<Url>,
    /// Interval between connectivity probes.
    #[serde(default = "default_probe_interval")]
    pub probe_interval: Duration,
    /// Orchestrator settings.
    #[serde(default)]
    pub sync: SyncConfig,
    /// When syncs happen without an explicit request.
    #[serde(default = "default_sync_mode")]
    pub sync_mode: SyncMode,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Manual
}

impl EngineConfig {
    /// Configuration rooted at `data_dir`.
    pub fn in_dir(data_dir: impl AsRef<Path>) -> Self {
        Self {
            database_path: data_dir.as_ref().join(DATABASE_FILENAME),
            endpoint: None,
            probe_url: None,
            probe_interval: default_probe_interval(),
            sync: SyncConfig::default(),
            sync_mode: default_sync_mode(),
        }
    }

    /// Platform data directory for the engine, e.g. `~/.local/share/fieldsync`.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIRNAME)
    }

    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        Self::default_data_dir().join(CONFIG_FILENAME)
    }

    /// URL used for connectivity probing, if any.
    pub fn effective_probe_url(&self) -> Option<&Url> {
        self.probe_url.as_ref().or(self.endpoint.as_ref())
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.as_os_str().is_empty() {
            return Err(Error::Config("database_path must not be empty".to_string()));
        }
        if self.sync.submission_timeout.is_zero() {
            return Err(Error::Config(
                "submission_timeout must be greater than zero".to_string(),
            ));
        }
        if self.probe_interval.is_zero() {
            return Err(Error::Config(
                "probe_interval must be greater than zero".to_string(),
            ));
        }
        if let SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } = &self.sync_mode {
            if interval.is_zero() {
                return Err(Error::Config("sync interval must be greater than zero".to_string()));
            }
        }
        if self.sync_mode != SyncMode::Manual && self.endpoint.is_none() {
            return Err(Error::Config(
                "automatic sync modes require an endpoint".to_string(),
            ));
        }
        Ok(())
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Load and validate a configuration file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Serialization` if it is not a valid configuration
    /// - `Config` if a value is out of range
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        let config = Self::from_json(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, or fall back to defaults if it does not exist.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if tokio::fs::try_exists(path).await? {
            Self::load(path).await
        } else {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            Ok(Self::in_dir(dir))
        }
    }

    /// Write the configuration, creating parent directories as needed.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_json()?).await?;
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::in_dir(Self::default_data_dir())
    }
}
