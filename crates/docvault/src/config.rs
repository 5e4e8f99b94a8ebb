//! Vault configuration module

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Vault configuration, passed explicitly into every service that touches disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root directory of the physical document tree
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// SQLite URL of the relational index
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Maximum database connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Window in which identical pure-read activity records collapse into one
    #[serde(default = "default_read_dedup_window_secs")]
    pub read_dedup_window_secs: u64,

    /// Default size of the recent-activity spot check
    #[serde(default = "default_recent_activity_limit")]
    pub recent_activity_limit: u32,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./storage")
}

fn default_database_url() -> String {
    "sqlite://./data/docvault.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_read_dedup_window_secs() -> u64 {
    5
}

fn default_recent_activity_limit() -> u32 {
    20
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            read_dedup_window_secs: default_read_dedup_window_secs(),
            recent_activity_limit: default_recent_activity_limit(),
        }
    }
}

impl VaultConfig {
    /// Create a new config with default values
    pub fn new(storage_root: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let storage_root = std::env::var("DOCVAULT_STORAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_storage_root());
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| default_database_url());
        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_max_connections);
        let read_dedup_window_secs = std::env::var("DOCVAULT_READ_DEDUP_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_read_dedup_window_secs);
        let recent_activity_limit = std::env::var("DOCVAULT_RECENT_ACTIVITY_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(default_recent_activity_limit);

        Self {
            storage_root,
            database_url,
            max_connections,
            read_dedup_window_secs,
            recent_activity_limit,
        }
    }

    pub fn read_dedup_window(&self) -> Duration {
        Duration::from_secs(self.read_dedup_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_defaults() {
        let config: VaultConfig = serde_json::from_str(r#"{"storage_root": "/srv/docs"}"#).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/srv/docs"));
        assert_eq!(config.database_url, "sqlite://./data/docvault.db");
        assert_eq!(config.max_connections, 5);
        assert_eq!(config.read_dedup_window(), Duration::from_secs(5));
    }
}
