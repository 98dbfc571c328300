//! Configuration for the network state database
//!
//! Loads and validates configuration from TOML files.
//! Default location: /etc/sonic/ndbsyncd.conf

use crate::error::{NdbError, Result};
use crate::store::MEMORY;
use crate::types::{DEFAULT_ORIGIN, Origin};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/ndbsyncd.conf";

/// Store backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum DbConfig {
    /// Embedded store: `":memory:"` or a database file path
    Sqlite {
        #[serde(default = "default_sqlite_spec")]
        spec: String,
    },
    /// Client/server store, e.g. `postgres://ndb@localhost/ndb`
    Postgres { url: String },
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite {
            spec: default_sqlite_spec(),
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NdbConfig {
    /// Mirror every inbound message into the `rtnl_log` table
    #[serde(default)]
    pub rtnl_log: bool,

    /// Interval between dead handler sweeps, in milliseconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_ms: u64,

    /// How long startup waits for the dispatch loop, in milliseconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,

    /// Origin assumed by keys that do not name one
    #[serde(default = "default_origin")]
    pub default_origin: Origin,

    /// Store backend
    #[serde(default)]
    pub db: DbConfig,

    /// State files to attach at startup, by origin name
    #[serde(default)]
    pub sources: BTreeMap<String, PathBuf>,
}

fn default_sqlite_spec() -> String {
    MEMORY.to_string()
}

fn default_gc_interval() -> u64 {
    60_000
}

fn default_startup_timeout() -> u64 {
    30_000
}

fn default_origin() -> Origin {
    Origin::new(DEFAULT_ORIGIN)
}

impl Default for NdbConfig {
    fn default() -> Self {
        Self {
            rtnl_log: false,
            gc_interval_ms: default_gc_interval(),
            startup_timeout_ms: default_startup_timeout(),
            default_origin: default_origin(),
            db: DbConfig::default(),
            sources: BTreeMap::new(),
        }
    }
}

impl NdbConfig {
    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| {
            NdbError::Config(format!(
                "Failed to load config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Serialize configuration to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| NdbError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// In-memory sqlite configuration with default settings
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        match &self.db {
            DbConfig::Sqlite { spec } if spec.is_empty() => {
                return Err(NdbError::Config("sqlite spec must not be empty".to_string()));
            }
            DbConfig::Postgres { url } if url.is_empty() => {
                return Err(NdbError::Config("postgres url must not be empty".to_string()));
            }
            _ => {}
        }

        if self.startup_timeout_ms == 0 {
            return Err(NdbError::Config(
                "startup_timeout_ms must be > 0".to_string(),
            ));
        }

        if self.default_origin.as_str().is_empty() {
            return Err(NdbError::Config(
                "default_origin must not be empty".to_string(),
            ));
        }

        if self.sources.keys().any(|name| name.is_empty()) {
            return Err(NdbError::Config("source names must not be empty".to_string()));
        }

        Ok(())
    }
}
