//! Caching policy attached to a library configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a library's fetched versions are kept in the shared cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingPolicy {
    /// Minutes after which a cached version is refetched (0 = never)
    pub refresh_minutes: u64,

    /// Space-separated substrings; matching versions skip the shared cache
    pub excluded_versions: String,

    /// Space-separated substrings, reserved and not consulted yet
    pub included_versions: String,
}

impl CachingPolicy {
    pub fn new(refresh_minutes: u64) -> Self {
        Self {
            refresh_minutes,
            ..Self::default()
        }
    }

    pub fn with_excluded(mut self, patterns: impl Into<String>) -> Self {
        self.excluded_versions = patterns.into();
        self
    }

    pub fn is_refresh_enabled(&self) -> bool {
        self.refresh_minutes > 0
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_minutes.saturating_mul(60))
    }

    pub fn excluded_patterns(&self) -> impl Iterator<Item = &str> {
        self.excluded_versions.split_whitespace()
    }

    pub fn included_patterns(&self) -> impl Iterator<Item = &str> {
        self.included_versions.split_whitespace()
    }

    /// Whether `version` must bypass the shared cache
    pub fn is_excluded(&self, version: &str) -> bool {
        self.excluded_patterns().any(|pattern| version.contains(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_refresh_never_expires() {
        let policy = CachingPolicy::new(0);
        assert!(!policy.is_refresh_enabled());
        assert!(CachingPolicy::new(5).is_refresh_enabled());
        assert_eq!(CachingPolicy::new(2).refresh_interval(), Duration::from_secs(120));
    }

    #[test]
    fn exclusion_is_substring_match() {
        let policy = CachingPolicy::new(0).with_excluded("SNAPSHOT  feature/");
        assert!(policy.is_excluded("1.0-SNAPSHOT"));
        assert!(policy.is_excluded("feature/login"));
        assert!(!policy.is_excluded("1.0"));
        assert_eq!(policy.excluded_patterns().count(), 2);
    }

    #[test]
    fn empty_exclusions_match_nothing() {
        let policy = CachingPolicy::default();
        assert!(!policy.is_excluded(""));
        assert!(!policy.is_excluded("main"));
    }

    #[test]
    fn deserializes_partial_table() {
        let policy: CachingPolicy = toml::from_str("refresh_minutes = 30").unwrap();
        assert_eq!(policy.refresh_minutes, 30);
        assert!(policy.excluded_versions.is_empty());
    }
}
