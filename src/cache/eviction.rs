//! Operator-triggered removal of cache entries by library name

use super::entry::{entry_keys, CacheEntry};
use super::lock::LockRegistry;
use crate::error::PipelibResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which entries to evict
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EvictionRequest {
    pub library_name: String,
    /// Space-separated versions; `None` matches every version
    pub versions: Option<String>,
    /// Delete without waiting for the entry's lock
    pub force: bool,
}

impl EvictionRequest {
    pub fn new(library_name: impl Into<String>) -> Self {
        Self {
            library_name: library_name.into(),
            ..Self::default()
        }
    }

    fn matches(&self, name: &str, version: &str) -> bool {
        if name != self.library_name {
            return false;
        }
        match &self.versions {
            Some(selector) if !selector.trim().is_empty() => {
                selector.split_whitespace().any(|v| v == version)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionStatus {
    Ok,
    Error,
}

/// One removed entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedEntry {
    pub key: String,
    pub version: String,
}

/// Outcome reported back to the operator
#[derive(Debug, Clone, Serialize)]
pub struct EvictionResponse {
    pub status: EvictionStatus,
    pub message: String,
    pub removed: Vec<EvictedEntry>,
}

/// Deletes cache entries on operator request
#[derive(Debug, Clone)]
pub struct ManualEviction {
    root: PathBuf,
    locks: Arc<LockRegistry>,
    timeout: Duration,
}

impl ManualEviction {
    pub fn new(root: impl Into<PathBuf>, locks: Arc<LockRegistry>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            locks,
            timeout,
        }
    }

    /// Remove every entry matching `request`
    pub fn evict(&self, request: &EvictionRequest) -> EvictionResponse {
        let matches = match self.find(request) {
            Ok(matches) => matches,
            Err(e) => {
                return EvictionResponse {
                    status: EvictionStatus::Error,
                    message: format!("Could not scan cache: {}", e),
                    removed: Vec::new(),
                }
            }
        };

        if matches.is_empty() {
            return EvictionResponse {
                status: EvictionStatus::Ok,
                message: format!("No cache entries found for library {}", request.library_name),
                removed: Vec::new(),
            };
        }

        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for (entry, version) in matches {
            match self.remove(&entry, request.force) {
                Ok(()) => {
                    info!("Evicted {}@{} ({})", request.library_name, version, entry.key());
                    removed.push(EvictedEntry {
                        key: entry.key().to_string(),
                        version,
                    });
                }
                Err(e) => {
                    warn!("Could not evict {}: {}", entry.key(), e);
                    failures.push(format!("{}@{}: {}", request.library_name, version, e));
                }
            }
        }

        if failures.is_empty() {
            let versions: Vec<&str> = removed.iter().map(|r| r.version.as_str()).collect();
            EvictionResponse {
                status: EvictionStatus::Ok,
                message: format!(
                    "Removed {} cache entr{} for {}: {}",
                    removed.len(),
                    if removed.len() == 1 { "y" } else { "ies" },
                    request.library_name,
                    versions.join(", ")
                ),
                removed,
            }
        } else {
            EvictionResponse {
                status: EvictionStatus::Error,
                message: format!(
                    "Removed {} entries; failed: {}",
                    removed.len(),
                    failures.join("; ")
                ),
                removed,
            }
        }
    }

    fn find(&self, request: &EvictionRequest) -> PipelibResult<Vec<(CacheEntry, String)>> {
        let mut found = Vec::new();
        for key in entry_keys(&self.root)? {
            let entry = CacheEntry::new(&self.root, key);
            if let Some(marker) = entry.read_name_marker() {
                if request.matches(&marker.name, &marker.version) {
                    found.push((entry, marker.version));
                }
            }
        }
        Ok(found)
    }

    fn remove(&self, entry: &CacheEntry, force: bool) -> PipelibResult<()> {
        if force {
            return entry.remove();
        }
        let lock = self.locks.lock_for(&self.root, entry.key());
        let _exclusive = lock.write_within(self.timeout)?;
        entry.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::NameMarker;
    use crate::cancel::CancelToken;
    use std::fs;
    use tempfile::TempDir;

    fn seed(root: &std::path::Path, key: &str, name: &str, version: &str) -> CacheEntry {
        let entry = CacheEntry::new(root, key);
        fs::create_dir_all(entry.artifact_path()).unwrap();
        entry.touch_last_read().unwrap();
        entry
            .write_name_marker(&NameMarker {
                name: name.to_string(),
                version: version.to_string(),
            })
            .unwrap();
        entry
    }

    fn eviction(temp: &TempDir, locks: Arc<LockRegistry>) -> ManualEviction {
        ManualEviction::new(temp.path(), locks, Duration::from_millis(100))
    }

    #[test]
    fn evicts_all_versions_of_a_library() {
        let temp = TempDir::new().unwrap();
        let a = seed(temp.path(), "a", "utils", "1.0");
        let b = seed(temp.path(), "b", "utils", "2.0");
        let other = seed(temp.path(), "c", "notify", "1.0");

        let response = eviction(&temp, Arc::new(LockRegistry::new()))
            .evict(&EvictionRequest::new("utils"));

        assert_eq!(response.status, EvictionStatus::Ok);
        assert_eq!(response.removed.len(), 2);
        assert!(!a.exists() && !b.exists());
        assert!(!a.name_marker_path().exists());
        assert!(other.exists());
    }

    #[test]
    fn version_selector_limits_matches() {
        let temp = TempDir::new().unwrap();
        let a = seed(temp.path(), "a", "utils", "1.0");
        let b = seed(temp.path(), "b", "utils", "2.0");

        let request = EvictionRequest {
            versions: Some("2.0 3.0".to_string()),
            ..EvictionRequest::new("utils")
        };
        let response = eviction(&temp, Arc::new(LockRegistry::new())).evict(&request);

        assert_eq!(
            response.removed,
            vec![EvictedEntry {
                key: "b".to_string(),
                version: "2.0".to_string(),
            }]
        );
        assert!(a.exists());
        assert!(!b.exists());
    }

    #[test]
    fn no_match_is_reported() {
        let temp = TempDir::new().unwrap();
        let response = eviction(&temp, Arc::new(LockRegistry::new()))
            .evict(&EvictionRequest::new("utils"));
        assert_eq!(response.status, EvictionStatus::Ok);
        assert!(response.removed.is_empty());
        assert!(response.message.contains("No cache entries"));
    }

    #[test]
    fn safe_mode_times_out_on_held_lock() {
        let temp = TempDir::new().unwrap();
        let locks = Arc::new(LockRegistry::new());
        let entry = seed(temp.path(), "a", "utils", "1.0");
        let lock = locks.lock_for(temp.path(), "a");
        let _reader = lock.read_interruptibly(&CancelToken::new()).unwrap();

        let response = eviction(&temp, Arc::clone(&locks)).evict(&EvictionRequest::new("utils"));

        assert_eq!(response.status, EvictionStatus::Error);
        assert!(response.message.contains("Timed out"));
        assert!(entry.exists());
    }

    // The reader belongs to a build running in another pipelib process
    #[cfg(unix)]
    #[test]
    fn safe_mode_waits_for_readers_in_other_processes() {
        let temp = TempDir::new().unwrap();
        let entry = seed(temp.path(), "a", "utils", "1.0");
        let build_locks = LockRegistry::new();
        let lock = build_locks.lock_for(temp.path(), "a");
        let reader = lock.read_interruptibly(&CancelToken::new()).unwrap();

        let operator = eviction(&temp, Arc::new(LockRegistry::new()));
        let response = operator.evict(&EvictionRequest::new("utils"));
        assert_eq!(response.status, EvictionStatus::Error);
        assert!(entry.exists());

        drop(reader);
        let response = operator.evict(&EvictionRequest::new("utils"));
        assert_eq!(response.status, EvictionStatus::Ok);
        assert!(!entry.exists());
    }

    #[test]
    fn forced_mode_ignores_lock() {
        let temp = TempDir::new().unwrap();
        let locks = Arc::new(LockRegistry::new());
        let entry = seed(temp.path(), "a", "utils", "1.0");
        let lock = locks.lock_for(temp.path(), "a");
        let _reader = lock.read_interruptibly(&CancelToken::new()).unwrap();

        let request = EvictionRequest {
            force: true,
            ..EvictionRequest::new("utils")
        };
        let response = eviction(&temp, Arc::clone(&locks)).evict(&request);

        assert_eq!(response.status, EvictionStatus::Ok);
        assert!(!entry.exists());
    }
}
