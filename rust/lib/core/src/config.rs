use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Server configuration.
///
/// Loaded from an optional TOML file, then overridden by command-line flags.
/// Every field has a default, so an empty file is a valid configuration:
///
/// ```toml
/// listen = "127.0.0.1:8080"
/// data_dir = "/var/lib/itemd"
/// drain_timeout_secs = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding the database file.
    pub data_dir: PathBuf,

    /// Path to the redb database file.
    /// Defaults to `{data_dir}/data.redb` if not specified.
    pub db_path: Option<PathBuf>,

    /// Listen address for the HTTP server.
    pub listen: String,

    /// How long shutdown waits for in-flight requests before aborting them.
    pub drain_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            db_path: None,
            listen: "0.0.0.0:8080".to_string(),
            drain_timeout_secs: 2,
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the redb database path, falling back to `{data_dir}/data.redb`.
    pub fn resolve_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("data.redb"))
    }

    /// Drain deadline applied on shutdown.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}
