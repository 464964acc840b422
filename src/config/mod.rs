//! Configuration management for Stockpile

pub mod schema;

pub use schema::{Config, GeneralConfig, QuotaConfig, ReplicationConfig, StoreConfig};

use crate::error::{StockpileError, StockpileResult};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Locates, reads and writes `config.toml`
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Manager for `<config dir>/stockpile/config.toml`
    pub fn new() -> Self {
        let config_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stockpile")
            .join("config.toml");
        Self { config_path }
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Read the config file; a missing file yields the defaults
    pub async fn load(&self) -> StockpileResult<Config> {
        let path = &self.config_path;
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(StockpileError::io(
                    format!("reading config from {}", path.display()),
                    e,
                ))
            }
        };

        toml::from_str(&content).map_err(|e| StockpileError::ConfigInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })
    }

    /// Write `config`, creating the parent directory if needed
    pub async fn save(&self, config: &Config) -> StockpileResult<()> {
        let path = &self.config_path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StockpileError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(path, content)
            .await
            .map_err(|e| StockpileError::io(format!("writing config to {}", path.display()), e))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
