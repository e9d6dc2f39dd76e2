//! # Configuration Management
//!
//! Settings for a syncpair node live in a TOML file, by default
//! `~/.config/syncpair/config.toml` on Linux. A missing file simply means
//! defaults. Both locations can be redirected with environment variables,
//! which the integration tests use for isolation:
//!
//! - `SYNCPAIR_CONFIG_DIR` replaces the config directory
//! - `SYNCPAIR_DATA_DIR` replaces the directory holding `state.json`
//!
//! The node record itself (peer, folder snapshot, port) is not part of the
//! configuration; see [`crate::state`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::address::detect_local_host;
use crate::frontend::PairingPolicy;
use crate::node::NodeOptions;

pub const DEFAULT_PORT: u16 = 6666;

const CONFIG_DIR_ENV: &str = "SYNCPAIR_CONFIG_DIR";
const DATA_DIR_ENV: &str = "SYNCPAIR_DATA_DIR";
const APP_DIR: &str = "syncpair";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Advertised and bound host. Detected from the routing table when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Port for a node without a saved record.
    pub default_port: u16,
    /// Override for the node record location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    /// Answer to pairing requests when nobody is at the console.
    pub pairing: PairingPolicy,

    #[serde(skip)]
    pub config_file_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: None,
            default_port: DEFAULT_PORT,
            state_file: None,
            pairing: PairingPolicy::default(),
            config_file_path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Write a default configuration file, keeping an existing one.
    pub async fn init(path: Option<&Path>) -> Result<Self> {
        let config_file = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if config_file.exists() {
            return Self::load_from(&config_file).await;
        }

        let config = Self {
            config_file_path: config_file,
            ..Self::default()
        };
        config.save().await?;
        Ok(config)
    }

    /// Load from `path`, or from the default location when `None`.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path).await,
            None => Self::load_from(&Self::default_config_path()?).await,
        }
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?
        } else {
            Config::default()
        };

        config.config_file_path = path.to_path_buf();
        Ok(config)
    }

    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_file_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(&self.config_file_path, content).await?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    /// Location of the node record, honoring the `state_file` override.
    pub fn state_path(&self) -> Result<PathBuf> {
        match &self.state_file {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("state.json")),
        }
    }

    /// Node settings after applying command line overrides.
    pub fn node_options(
        &self,
        host: Option<String>,
        state_file: Option<PathBuf>,
    ) -> Result<NodeOptions> {
        let host = host
            .or_else(|| self.host.clone())
            .unwrap_or_else(detect_local_host);
        let state_path = match state_file {
            Some(path) => path,
            None => self.state_path()?,
        };

        Ok(NodeOptions {
            host,
            port: self.default_port,
            state_path,
        })
    }

    pub fn default_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?
            .join(APP_DIR);
        Ok(config_dir)
    }

    pub fn data_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?
            .join(APP_DIR);
        Ok(data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let config = Config::load_from(&path).await.unwrap();
        assert_eq!(config.default_port, DEFAULT_PORT);
        assert_eq!(config.pairing, PairingPolicy::Ask);
        assert!(config.host.is_none());
        assert_eq!(config.config_path(), path.as_path());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_config_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/config.toml");

        let config = Config {
            host: Some("10.1.2.3".to_string()),
            default_port: 7000,
            state_file: Some(temp_dir.path().join("node.json")),
            pairing: PairingPolicy::Always,
            config_file_path: path.clone(),
        };
        config.save().await.unwrap();

        let loaded = Config::load_from(&path).await.unwrap();
        assert_eq!(loaded.host.as_deref(), Some("10.1.2.3"));
        assert_eq!(loaded.default_port, 7000);
        assert_eq!(loaded.pairing, PairingPolicy::Always);
        assert_eq!(loaded.state_path().unwrap(), temp_dir.path().join("node.json"));
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "pairing = \"never\"\n").unwrap();

        let config = Config::load_from(&path).await.unwrap();
        assert_eq!(config.pairing, PairingPolicy::Never);
        assert_eq!(config.default_port, DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "default_port = \"many\"\n").unwrap();

        assert!(Config::load_from(&path).await.is_err());
    }

    #[test]
    fn test_node_options_prefer_overrides() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            host: Some("10.0.0.1".to_string()),
            state_file: Some(temp_dir.path().join("from-config.json")),
            ..Config::default()
        };

        let options = config
            .node_options(
                Some("192.168.0.2".to_string()),
                Some(temp_dir.path().join("from-flag.json")),
            )
            .unwrap();
        assert_eq!(options.host, "192.168.0.2");
        assert_eq!(options.port, DEFAULT_PORT);
        assert_eq!(options.state_path, temp_dir.path().join("from-flag.json"));

        let options = config.node_options(None, None).unwrap();
        assert_eq!(options.host, "10.0.0.1");
        assert_eq!(options.state_path, temp_dir.path().join("from-config.json"));
    }
}
