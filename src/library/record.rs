//! Resolved library records and their per-build persistence

use super::CachingPolicy;
use crate::cache::DirectoryNamer;
use crate::error::{PipelibError, PipelibResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

/// File under the build directory holding the build's resolved libraries
pub const RECORD_FILE: &str = "libraries.json";

/// One library as resolved for one build.
///
/// Immutable once created, except that symbols discovered after the fetch
/// are appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLibraryRecord {
    name: String,
    version: String,
    trusted: bool,
    changelog: bool,
    caching: Option<CachingPolicy>,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_path: Option<String>,
    directory_name: String,
    #[serde(default)]
    symbols: Vec<String>,
}

impl ResolvedLibraryRecord {
    /// Build a record, deriving its cache key from the identity fields
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namer: &DirectoryNamer,
        name: &str,
        version: &str,
        trusted: bool,
        changelog: bool,
        caching: Option<CachingPolicy>,
        source: &str,
        sub_path: Option<&str>,
    ) -> PipelibResult<Self> {
        let directory_name = namer.for_library(name, version, trusted, source, sub_path)?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            trusted,
            changelog,
            caching,
            source: source.to_string(),
            sub_path: sub_path.map(str::to_string),
            directory_name,
            symbols: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn changelog(&self) -> bool {
        self.changelog
    }

    pub fn caching(&self) -> Option<&CachingPolicy> {
        self.caching.as_ref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn sub_path(&self) -> Option<&str> {
        self.sub_path.as_deref()
    }

    pub fn directory_name(&self) -> &str {
        &self.directory_name
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Append newly discovered symbols, skipping ones already known
    pub fn add_symbols(&mut self, symbols: impl IntoIterator<Item = String>) {
        for symbol in symbols {
            if !self.symbols.contains(&symbol) {
                self.symbols.push(symbol);
            }
        }
    }
}

/// Every library resolved for one build, persisted next to the build
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LibrariesRecord {
    pub updated_at: Option<DateTime<Utc>>,
    pub libraries: Vec<ResolvedLibraryRecord>,
}

impl LibrariesRecord {
    /// Load the record of a build, or an empty one if none was saved
    pub fn load(build_dir: &Path) -> PipelibResult<Self> {
        let path = build_dir.join(RECORD_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| PipelibError::io(format!("reading {}", path.display()), e))?;
        let record: Self = serde_json::from_str(&content)?;
        debug!(
            "Loaded {} recorded libraries from {}",
            record.libraries.len(),
            path.display()
        );
        Ok(record)
    }

    /// Persist the record; the file is replaced atomically
    pub fn save(&mut self, build_dir: &Path) -> PipelibResult<()> {
        fs::create_dir_all(build_dir)
            .map_err(|e| PipelibError::io(format!("creating {}", build_dir.display()), e))?;

        self.updated_at = Some(Utc::now());
        let path = build_dir.join(RECORD_FILE);
        let tmp = build_dir.join(format!(".{}.{}", RECORD_FILE, uuid::Uuid::new_v4()));
        let content = serde_json::to_string_pretty(self)?;

        fs::write(&tmp, content)
            .map_err(|e| PipelibError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| PipelibError::io(format!("replacing {}", path.display()), e))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResolvedLibraryRecord> {
        self.libraries.iter().find(|record| record.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResolvedLibraryRecord> {
        self.libraries.iter_mut().find(|record| record.name() == name)
    }

    /// Add a record unless the build already has one for that name
    pub fn insert(&mut self, record: ResolvedLibraryRecord) -> bool {
        if self.get(record.name()).is_some() {
            return false;
        }
        self.libraries.push(record);
        true
    }
}
