//! Node configuration
//!
//! Each node keeps its identity, encryption key and database location in a
//! TOML file keyed by its listen port, created on first start and reused on
//! later ones.

use crate::crypto;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk shape of a node's config file
#[derive(Debug, Serialize, Deserialize)]
struct NodeConfigFile {
    server_id: String,
    /// 32-byte encryption key, hex-encoded
    enc_key: String,
    db_file: PathBuf,
}

/// Resolved per-node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: String,
    pub bootstrap_nodes: Vec<String>,
    pub server_id: String,
    pub enc_key: Vec<u8>,
    pub db_file: PathBuf,
}

fn port_of(listen_addr: &str) -> &str {
    listen_addr.rsplit(':').next().unwrap_or(listen_addr)
}

impl NodeConfig {
    /// Load the node's config file, or generate identity and key material
    /// and persist them on first start. `listen_addr` and the bootstrap list
    /// always come from the caller, not the file.
    pub fn load_or_create(
        config_dir: &Path,
        listen_addr: &str,
        bootstrap_nodes: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let port = port_of(listen_addr);
        let config_file = config_dir.join(format!("node_{}.toml", port));

        let file = if config_file.exists() {
            let content = fs::read_to_string(&config_file)?;
            toml::from_str::<NodeConfigFile>(&content)?
        } else {
            let file = NodeConfigFile {
                server_id: crypto::generate_id(),
                enc_key: hex::encode(crypto::new_encryption_key()),
                db_file: config_dir.join("db").join(format!("node_{}.db", port)),
            };
            fs::create_dir_all(config_dir)?;
            fs::write(&config_file, toml::to_string_pretty(&file)?)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&config_file, fs::Permissions::from_mode(0o600))?;
            }
            log::info!("[{}] created config {}", listen_addr, config_file.display());
            file
        };

        let enc_key = hex::decode(&file.enc_key)
            .map_err(|e| ConfigError::Invalid(format!("enc_key is not hex: {}", e)))?;
        if enc_key.len() != crypto::KEY_SIZE {
            return Err(ConfigError::Invalid(format!(
                "enc_key is {} bytes (expected {})",
                enc_key.len(),
                crypto::KEY_SIZE
            )));
        }
        if file.server_id.is_empty() {
            return Err(ConfigError::Invalid("server_id is empty".to_string()));
        }

        Ok(Self {
            listen_addr: listen_addr.to_string(),
            bootstrap_nodes,
            server_id: file.server_id,
            enc_key,
            db_file: file.db_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_then_reload() {
        let temp = TempDir::new().unwrap();

        let first = NodeConfig::load_or_create(temp.path(), ":3000", vec![]).unwrap();
        assert!(temp.path().join("node_3000.toml").exists());
        assert_eq!(first.enc_key.len(), crypto::KEY_SIZE);

        let second =
            NodeConfig::load_or_create(temp.path(), ":3000", vec![":4000".into()]).unwrap();
        assert_eq!(second.server_id, first.server_id);
        assert_eq!(second.enc_key, first.enc_key);
        assert_eq!(second.db_file, first.db_file);
        assert_eq!(second.bootstrap_nodes, vec![":4000".to_string()]);
    }

    #[test]
    fn test_nodes_get_distinct_identities() {
        let temp = TempDir::new().unwrap();

        let a = NodeConfig::load_or_create(temp.path(), ":3000", vec![]).unwrap();
        let b = NodeConfig::load_or_create(temp.path(), ":4000", vec![]).unwrap();
        assert_ne!(a.server_id, b.server_id);
        assert_ne!(a.db_file, b.db_file);
    }

    #[test]
    fn test_invalid_key_material() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("node_3000.toml"),
            "server_id = \"abc\"\nenc_key = \"not hex\"\ndb_file = \"x.db\"\n",
        )
        .unwrap();

        let err = NodeConfig::load_or_create(temp.path(), ":3000", vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_short_key_rejected() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("node_3000.toml"),
            "server_id = \"abc\"\nenc_key = \"aabbcc\"\ndb_file = \"x.db\"\n",
        )
        .unwrap();

        let err = NodeConfig::load_or_create(temp.path(), ":3000", vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
