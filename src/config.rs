//! Configuration management for the ledger node

use crate::error::{LedgerError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Identity this node signs its receipts with.
    #[serde(default = "default_public_key")]
    pub public_key: String,
    #[serde(default = "default_port")]
    pub api_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Port peers listen on when a peer entry does not carry its own.
    #[serde(default = "default_port")]
    pub peer_port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    /// Staged (candidate) blocks.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    /// Staged receipts.
    #[serde(default = "default_mempool_dir")]
    pub mempool_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            public_key: default_public_key(),
            api_port: default_port(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            peer_port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_sends: default_max_concurrent_sends(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            staging_dir: default_staging_dir(),
            mempool_dir: default_mempool_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs)
    }

    pub fn staging_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.staging_dir)
    }

    pub fn mempool_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.mempool_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.database_path.is_empty() {
            return Err(LedgerError::Config("storage.database_path must be set".to_string()));
        }
        if self.storage.staging_dir.is_empty() || self.storage.mempool_dir.is_empty() {
            return Err(LedgerError::Config(
                "storage.staging_dir and storage.mempool_dir must be set".to_string(),
            ));
        }
        if self.network.max_concurrent_sends == 0 {
            return Err(LedgerError::Config(
                "network.max_concurrent_sends must be at least 1".to_string(),
            ));
        }
        if self.network.request_timeout_secs == 0 {
            return Err(LedgerError::Config(
                "network.request_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads `path`, falling back to defaults when the file is absent.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let config: Config = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw)
            .map_err(|e| LedgerError::Config(format!("{}: {}", path.display(), e)))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => return Err(e.into()),
    };

    config.validate()?;
    Ok(config)
}

fn default_public_key() -> String {
    "local-node".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_request_timeout() -> u64 {
    3
}

fn default_max_concurrent_sends() -> usize {
    16
}

fn default_database_path() -> String {
    "./data/ledger.db".to_string()
}

fn default_staging_dir() -> String {
    "./data/tmp".to_string()
}

fn default_mempool_dir() -> String {
    "./data/mempool".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.peer_port, 8090);
        assert_eq!(config.network.max_concurrent_sends, 16);
        assert_eq!(config.storage.mempool_dir, "./data/mempool");
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[network]\npeer_port = 9000\nbootstrap_peers = [\"10.0.0.2\"]\n\n[node]\npublic_key = \"abc\"\n",
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.network.peer_port, 9000);
        assert_eq!(config.network.bootstrap_peers, vec!["10.0.0.2".to_string()]);
        assert_eq!(config.node.public_key, "abc");
        assert_eq!(config.request_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[network]\nmax_concurrent_sends = 0\n").unwrap();
        assert!(matches!(load_config(&path), Err(LedgerError::Config(_))));
    }
}
