//! Configuration management for pipelib

pub mod schema;

pub use schema::{CacheConfig, Config, GeneralConfig, LibraryConfig, ProviderConfig};

use crate::error::{PipelibError, PipelibResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pipelib")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pipelib")
    }

    /// Default location of the shared library cache
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pipelib")
            .join("libraries-cache")
    }

    /// Default location of the directory-name secret
    pub fn default_secret_key_path() -> PathBuf {
        Self::state_dir().join("secret.key")
    }

    /// Cache root configured in `config`, or the default
    pub fn cache_root(config: &Config) -> PathBuf {
        config
            .cache
            .root
            .clone()
            .unwrap_or_else(Self::default_cache_root)
    }

    /// Secret key path configured in `config`, or the default
    pub fn secret_key_path(config: &Config) -> PathBuf {
        config
            .cache
            .secret_key_path
            .clone()
            .unwrap_or_else(Self::default_secret_key_path)
    }

    /// Load configuration, using defaults if the file does not exist
    pub async fn load(&self) -> PipelibResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> PipelibResult<Config> {
        let content = fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PipelibError::ConfigNotFound(path.to_path_buf()),
            _ => PipelibError::io(format!("reading config from {}", path.display()), e),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| PipelibError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        validate(&config).map_err(|reason| PipelibError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> PipelibResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            PipelibError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> PipelibResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelibError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks serde cannot express
fn validate(config: &Config) -> Result<(), String> {
    for (i, provider) in config.providers.iter().enumerate() {
        if provider.id.trim().is_empty() {
            return Err(format!("provider #{} has an empty id", i + 1));
        }
        for library in &provider.libraries {
            if library.name.trim().is_empty() || library.name.contains('@') {
                return Err(format!(
                    "provider {} has an invalid library name '{}'",
                    provider.id, library.name
                ));
            }
        }
    }
    if !matches!(config.general.log_format.as_str(), "text" | "json") {
        return Err(format!(
            "general.log_format must be \"text\" or \"json\", got \"{}\"",
            config.general.log_format
        ));
    }
    Ok(())
}
