//! Store configuration, loaded from TOML.
//!
//! ```toml
//! default_resource_path = "assets/default-avatar.png"
//! operation_timeout_secs = 30
//! max_content_size = 10000000
//!
//! [database]
//! path = "data/resources.db"
//! max_connections = 4
//! busy_timeout_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, StoreError};

/// Default operation timeout in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 30;

/// Default upper bound on stored payloads (10 MB).
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 10 * 1000 * 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Backing file of the fallback resource served when an owner has none.
    pub default_resource_path: PathBuf,

    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. `None` keeps everything in memory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT_SECS
}

fn default_max_content_size() -> usize {
    DEFAULT_MAX_CONTENT_SIZE
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout_secs() -> u64 {
    5
}

impl StoreConfig {
    /// Minimal configuration with an in-memory database.
    pub fn new(default_resource_path: impl Into<PathBuf>) -> Self {
        Self {
            database: DatabaseConfig::default(),
            default_resource_path: default_resource_path.into(),
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(StoreError::Config(
                "database.max_connections must be at least 1".to_string(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(StoreError::Config(
                "operation_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
