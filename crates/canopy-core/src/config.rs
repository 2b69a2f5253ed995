use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Name of the optional engine config file inside the data directory.
pub const CONFIG_FILE: &str = "canopy.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub locking: LockingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockingConfig {
    /// How long lock acquisition polls before giving up with a
    /// concurrency-conflict error, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_timeout_ms(),
        }
    }
}

impl LockingConfig {
    #[must_use]
    pub const fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite busy handler timeout, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_timeout_ms(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

const fn default_timeout_ms() -> u64 {
    5_000
}

/// Load `<data_dir>/canopy.toml`; a missing file yields defaults.
pub fn load_engine_config(data_dir: &Path) -> Result<EngineConfig> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}
