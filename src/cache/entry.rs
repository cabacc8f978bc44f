//! On-disk cache entries
//!
//! Layout under the cache root:
//!
//! | Path | Contents |
//! |------|----------|
//! | `<key>` | the library artifact |
//! | `<key>.last_read` | marker; mtime is the last access |
//! | `<key>-name.txt` | library name and version, for eviction lookups |
//!
//! Staging directories start with `.` and are never addressable.

use crate::error::{PipelibError, PipelibResult};
use crate::fsutil::remove_path;
use crate::library::CachingPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Suffix of the last-read marker
pub const LAST_READ_SUFFIX: &str = ".last_read";

/// Suffix of the name marker
pub const NAME_MARKER_SUFFIX: &str = "-name.txt";

/// Prefix of in-progress fetch directories
pub const STAGING_PREFIX: &str = ".staging-";

/// State of a cache entry relative to its caching policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// No artifact on disk
    Missing,
    /// Artifact exists but is older than the refresh interval
    Expired,
    /// Artifact can be served as is
    Valid,
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "missing"),
            Self::Expired => write!(f, "expired"),
            Self::Valid => write!(f, "valid"),
        }
    }
}

/// Library identity stored in the name marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameMarker {
    pub name: String,
    pub version: String,
}

impl NameMarker {
    fn render(&self) -> String {
        format!("{}\n{}\n", self.name, self.version)
    }

    fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let name = lines.next()?.trim();
        if name.is_empty() {
            return None;
        }
        let version = lines.next().unwrap_or_default().trim();
        Some(Self {
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

/// One keyed entry under the cache root
#[derive(Debug, Clone)]
pub struct CacheEntry {
    root: PathBuf,
    key: String,
}

impl CacheEntry {
    pub fn new(root: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.root.join(&self.key)
    }

    pub fn last_read_path(&self) -> PathBuf {
        self.root.join(format!("{}{}", self.key, LAST_READ_SUFFIX))
    }

    pub fn name_marker_path(&self) -> PathBuf {
        self.root.join(format!("{}{}", self.key, NAME_MARKER_SUFFIX))
    }

    /// A fresh staging directory for fetching this entry
    pub fn staging_path(&self) -> PathBuf {
        self.root
            .join(format!("{}{}-{}", STAGING_PREFIX, self.key, uuid::Uuid::new_v4()))
    }

    pub fn exists(&self) -> bool {
        self.artifact_path().is_dir()
    }

    /// Evaluate the entry against `policy` at time `now`
    pub fn state(&self, policy: &CachingPolicy, now: SystemTime) -> PipelibResult<CacheState> {
        let path = self.artifact_path();
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => meta,
            Ok(_) => return Ok(CacheState::Missing),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CacheState::Missing),
            Err(e) => return Err(PipelibError::io(format!("inspecting {}", path.display()), e)),
        };

        if !policy.is_refresh_enabled() {
            return Ok(CacheState::Valid);
        }

        let modified = meta
            .modified()
            .map_err(|e| PipelibError::io(format!("reading mtime of {}", path.display()), e))?;
        if age(modified, now) >= policy.refresh_interval() {
            Ok(CacheState::Expired)
        } else {
            Ok(CacheState::Valid)
        }
    }

    /// Record a read now; the marker's mtime is the access time
    pub fn touch_last_read(&self) -> PipelibResult<()> {
        let path = self.last_read_path();
        fs::write(&path, Utc::now().to_rfc3339())
            .map_err(|e| PipelibError::io(format!("writing {}", path.display()), e))
    }

    /// Time since the last read, if a marker exists
    pub fn last_read_age(&self, now: SystemTime) -> PipelibResult<Option<Duration>> {
        Ok(self.last_read_at()?.map(|at| age(at, now)))
    }

    pub fn last_read_at(&self) -> PipelibResult<Option<SystemTime>> {
        let path = self.last_read_path();
        match fs::metadata(&path) {
            Ok(meta) => meta
                .modified()
                .map(Some)
                .map_err(|e| PipelibError::io(format!("reading mtime of {}", path.display()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PipelibError::io(format!("inspecting {}", path.display()), e)),
        }
    }

    pub fn write_name_marker(&self, marker: &NameMarker) -> PipelibResult<()> {
        let path = self.name_marker_path();
        fs::write(&path, marker.render())
            .map_err(|e| PipelibError::io(format!("writing {}", path.display()), e))
    }

    pub fn read_name_marker(&self) -> Option<NameMarker> {
        fs::read_to_string(self.name_marker_path())
            .ok()
            .and_then(|content| NameMarker::parse(&content))
    }

    /// Remove the artifact and both markers
    pub fn remove(&self) -> PipelibResult<()> {
        remove_path(&self.artifact_path())?;
        remove_path(&self.last_read_path())?;
        remove_path(&self.name_marker_path())
    }
}

fn age(then: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(then).unwrap_or(Duration::ZERO)
}

/// Summary of an entry for operator listings
#[derive(Debug, Clone, Serialize)]
pub struct CacheListing {
    pub key: String,
    pub name: Option<String>,
    pub version: Option<String>,
    pub last_read: Option<DateTime<Utc>>,
}

/// Keys of all addressable entries under `root`
pub fn entry_keys(root: &Path) -> PipelibResult<Vec<String>> {
    let read_dir = match fs::read_dir(root) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelibError::io(format!("reading {}", root.display()), e)),
    };

    let mut keys = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| PipelibError::io(format!("reading {}", root.display()), e))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir && !name.starts_with('.') {
            keys.push(name);
        }
    }
    keys.sort();
    Ok(keys)
}

/// List every entry under `root` with its marker data
pub fn list_entries(root: &Path) -> PipelibResult<Vec<CacheListing>> {
    entry_keys(root)?
        .into_iter()
        .map(|key| {
            let entry = CacheEntry::new(root, key.clone());
            let marker = entry.read_name_marker();
            Ok(CacheListing {
                key,
                name: marker.as_ref().map(|m| m.name.clone()),
                version: marker.map(|m| m.version),
                last_read: entry.last_read_at()?.map(DateTime::<Utc>::from),
            })
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn backdate(path: &Path, by: Duration) {
    let when = SystemTime::now() - by;
    let file = fs::File::options()
        .read(true)
        .open(path)
        .or_else(|_| fs::File::options().write(true).open(path))
        .unwrap();
    file.set_modified(when).unwrap();
}
