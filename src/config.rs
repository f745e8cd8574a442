//! Configuration management for the chaind node.
//!
//! The config is a TOML file. On first run a default one is written next to
//! the path the user gave; missing sections fall back to defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::chain::ChainParams;
use crate::error::AppError;

/// Platform-specific data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chaind")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chaind")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "chaind".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// "host:port" entries merged into the peer directory at startup
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

fn default_max_connections() -> usize {
    1024
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 8333,
            max_connections: default_max_connections(),
            bootstrap_peers: vec![],
        }
    }
}

impl NetworkConfig {
    pub fn full_listen_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Empty means the platform default from [`get_data_dir`]
    pub data_dir: String,
}

impl StorageConfig {
    pub fn data_path(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            get_data_dir()
        } else {
            PathBuf::from(&self.data_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub retarget_interval: u64,
    pub target_spacing_secs: u64,
    pub cache_window: u64,
    #[serde(default)]
    pub mining_enabled: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        let params = ChainParams::default();
        Self {
            retarget_interval: params.retarget_interval,
            target_spacing_secs: params.target_spacing_secs,
            cache_window: params.cache_window,
            mining_enabled: false,
        }
    }
}

impl ConsensusConfig {
    pub fn chain_params(&self) -> ChainParams {
        ChainParams {
            retarget_interval: self.retarget_interval,
            target_spacing_secs: self.target_spacing_secs,
            cache_window: self.cache_window,
            ..ChainParams::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/chaind.log".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if fs::metadata(path).is_ok() {
            return Self::load_from_file(path);
        }

        let config = Self::default();
        if let Some(parent) = PathBuf::from(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        config.save_to_file(path)?;
        tracing::info!("Created default config at {}", path);
        Ok(config)
    }

    /// Reject settings the node cannot run with.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.network.max_connections == 0 {
            return Err(AppError::Config(
                "network.max_connections must be at least 1".into(),
            ));
        }
        if self.consensus.target_spacing_secs == 0 {
            return Err(AppError::Config(
                "consensus.target_spacing_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
