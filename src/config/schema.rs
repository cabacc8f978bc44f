//! Configuration schema for pipelib
//!
//! Configuration is stored at `~/.config/pipelib/config.toml`

use crate::library::{CachingPolicy, LibraryFlags};
use crate::retriever::{LibraryRetriever, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Shared cache settings
    pub cache: CacheConfig,

    /// Library providers, searched in order
    pub providers: Vec<ProviderConfig>,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Shared cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root (default: platform cache dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Delete entries unread for longer than N days
    pub retention_days: u64,

    /// Hours between janitor sweeps
    pub sweep_interval_hours: u64,

    /// Extra fetch attempts after the first one fails
    pub fetch_retries: u32,

    /// Pause between fetch attempts
    pub fetch_retry_delay_ms: u64,

    /// How long safe eviction waits for an entry's lock
    pub eviction_timeout_secs: u64,

    /// Secret key for directory names (default: state dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            retention_days: 7,
            sweep_interval_hours: 12,
            fetch_retries: 3,
            fetch_retry_delay_ms: 1000,
            eviction_timeout_secs: 30,
            secret_key_path: None,
        }
    }
}

impl CacheConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours.max(1).saturating_mul(60 * 60))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch_retries.saturating_add(1),
            delay: Duration::from_millis(self.fetch_retry_delay_ms),
        }
    }

    pub fn eviction_timeout(&self) -> Duration {
        Duration::from_secs(self.eviction_timeout_secs)
    }
}

/// A source of library definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Source descriptor recorded on every library from this provider
    pub id: String,

    /// Libraries from this provider run outside the sandbox
    #[serde(default)]
    pub trusted: bool,

    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

/// One library definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<String>,

    #[serde(flatten)]
    pub flags: LibraryFlags,

    /// Absent disables the shared cache for this library
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CachingPolicy>,

    pub retriever: LibraryRetriever,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[cache]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.retention_days, 7);
        assert_eq!(config.cache.sweep_interval_hours, 12);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            retention_days = 3
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.retention_days, 3);
        assert_eq!(config.cache.fetch_retries, 3); // default preserved
        assert_eq!(config.general.log_format, "text");
    }

    #[test]
    fn providers_and_libraries_deserialize() {
        let toml = r#"
            [[providers]]
            id = "global"
            trusted = true

            [[providers.libraries]]
            name = "utils"
            default_version = "main"
            allow_branch_name_placeholder = true
            implicit = true

            [providers.libraries.caching]
            refresh_minutes = 60
            excluded_versions = "SNAPSHOT feature/"

            [providers.libraries.retriever]
            kind = "git"
            remote = "https://example.com/utils.git"
            library_path = "lib"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let provider = &config.providers[0];
        assert_eq!(provider.id, "global");
        assert!(provider.trusted);

        let library = &provider.libraries[0];
        assert_eq!(library.default_version.as_deref(), Some("main"));
        assert!(library.flags.allow_branch_name_placeholder);
        assert!(library.flags.allow_override);
        assert!(library.flags.implicit);
        let caching = library.caching.as_ref().unwrap();
        assert!(caching.is_excluded("feature/x"));
        assert!(matches!(library.retriever, LibraryRetriever::Git(_)));
    }

    #[test]
    fn unknown_retriever_kind_is_rejected() {
        let toml = r#"
            [[providers]]
            id = "global"

            [[providers.libraries]]
            name = "utils"

            [providers.libraries.retriever]
            kind = "svn"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn durations_follow_settings() {
        let cache = CacheConfig {
            retention_days: 2,
            fetch_retries: 0,
            ..CacheConfig::default()
        };
        assert_eq!(cache.retention(), Duration::from_secs(2 * 86_400));
        assert_eq!(cache.retry_policy().attempts, 1);
        assert_eq!(CacheConfig::default().retry_policy().attempts, 4);
        assert_eq!(cache.eviction_timeout(), Duration::from_secs(30));
    }
}
