//! Persisted node configuration.
//!
//! A JSON file at a caller-chosen path holds everything a node needs to
//! come back with the same identity: the DHT node id, the Noise static
//! secret key, the listen port, bootstrap nodes and the download directory.
//! An absent file yields a freshly generated identity which is written
//! back atomically.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::identifiers::NodeId;
use crate::keys::StaticSecretKey;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying filesystem failure
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File exists but does not parse
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// A hex field does not decode to the expected length
    #[error("invalid {field} in config: {source}")]
    InvalidField {
        /// Name of the offending field
        field: &'static str,
        /// Hex decoding failure
        source: hex::FromHexError,
    },
}

/// A DHT bootstrap endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapNode {
    /// Hostname or IP literal
    pub host: String,
    /// UDP port
    pub port: u16,
}

/// Well-known public bootstrap nodes used when the config lists none.
pub fn default_bootstrap_nodes() -> Vec<BootstrapNode> {
    vec![
        BootstrapNode {
            host: "router.bittorrent.com".to_string(),
            port: 6881,
        },
        BootstrapNode {
            host: "dht.transmissionbt.com".to_string(),
            port: 6881,
        },
    ]
}

/// On-disk representation of the node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfigFile {
    node_id: String,
    noise_static_sk: String,
    listen_port: u16,
    #[serde(default)]
    bootstrap_nodes: Vec<BootstrapNode>,
    file_dir: PathBuf,
    #[serde(default)]
    max_peers: usize,
    #[serde(default)]
    created_at: u64,
    #[serde(default)]
    updated_at: u64,
}

/// Node configuration with decoded identity material.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable DHT identity
    pub node_id: NodeId,
    /// Noise static secret key
    pub noise_static_sk: StaticSecretKey,
    /// TCP/UDP listen port (0 = ephemeral)
    pub listen_port: u16,
    /// DHT bootstrap endpoints
    pub bootstrap_nodes: Vec<BootstrapNode>,
    /// Directory received files land in
    pub file_dir: PathBuf,
    /// Cap on simultaneous live sessions (0 = unlimited)
    pub max_peers: usize,
    /// Unix seconds when the identity was first generated
    pub created_at: u64,
}

impl Config {
    /// Generates a fresh configuration with a new identity.
    pub fn generate(listen_port: u16) -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);

        Self {
            node_id: NodeId::from_seed(&seed),
            noise_static_sk: StaticSecretKey::random(),
            listen_port,
            bootstrap_nodes: default_bootstrap_nodes(),
            file_dir: PathBuf::from("downloads"),
            max_peers: 0,
            created_at: unix_now(),
        }
    }

    /// Loads the configuration at `path`, generating a new identity in
    /// memory when the file does not exist.
    ///
    /// A generated configuration is not written here; it reaches disk
    /// atomically on the first shutdown via [`Config::save`].
    pub fn load_or_generate(path: &Path, listen_port: u16) -> Result<Self, ConfigError> {
        if path.exists() {
            let config = Self::load(path)?;
            info!(node_id = %config.node_id, "loaded existing identity");
            return Ok(config);
        }

        info!("no configuration found, generating new identity");
        Ok(Self::generate(listen_port))
    }

    /// Loads the configuration from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let file: ConfigFile = serde_json::from_str(&data)?;

        let node_id =
            NodeId::from_hex(&file.node_id).map_err(|source| ConfigError::InvalidField {
                field: "node_id",
                source,
            })?;
        let noise_static_sk = StaticSecretKey::from_hex(&file.noise_static_sk).map_err(
            |source| ConfigError::InvalidField {
                field: "noise_static_sk",
                source,
            },
        )?;

        Ok(Self {
            node_id,
            noise_static_sk,
            listen_port: file.listen_port,
            bootstrap_nodes: if file.bootstrap_nodes.is_empty() {
                default_bootstrap_nodes()
            } else {
                file.bootstrap_nodes
            },
            file_dir: file.file_dir,
            max_peers: file.max_peers,
            created_at: file.created_at,
        })
    }

    /// Persists the configuration atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = ConfigFile {
            node_id: self.node_id.to_hex(),
            noise_static_sk: self.noise_static_sk.to_hex(),
            listen_port: self.listen_port,
            bootstrap_nodes: self.bootstrap_nodes.clone(),
            file_dir: self.file_dir.clone(),
            max_peers: self.max_peers,
            created_at: self.created_at,
            updated_at: unix_now(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let data = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rats.json");

        let config = Config::generate(8000);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.noise_static_sk, config.noise_static_sk);
        assert_eq!(loaded.listen_port, 8000);
        assert!(!loaded.bootstrap_nodes.is_empty());
    }

    #[test]
    fn test_load_or_generate_defers_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rats.json");

        // Generation alone leaves no file; that happens at shutdown.
        let first = Config::load_or_generate(&path, 8000).unwrap();
        assert!(!path.exists());

        first.save(&path).unwrap();
        assert!(path.exists());

        // Identity survives once persisted.
        let second = Config::load_or_generate(&path, 9000).unwrap();
        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.listen_port, second.listen_port);
    }

    #[test]
    fn test_load_rejects_bad_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rats.json");
        std::fs::write(
            &path,
            r#"{"node_id":"zz","noise_static_sk":"00","listen_port":1,"file_dir":"d"}"#,
        )
        .unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::InvalidField { field: "node_id", .. })
        ));
    }
}
