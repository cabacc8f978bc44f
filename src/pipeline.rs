//! Build-level library retrieval
//!
//! For each library a build uses: resolve the version, derive the cache
//! key, get the artifact into `<build>/libs/<key>` through the shared
//! cache, then list the script entries it exposes. Libraries are
//! retrieved on their own threads and fail independently.
//!
//! Resolved records are saved to `<build>/libraries.json`. A resumed build
//! reuses them as recorded instead of resolving again.

use crate::cache::{CacheCoordinator, CacheOutcome, DirectoryNamer, LockRegistry};
use crate::config::{Config, ConfigManager};
use crate::context::BuildContext;
use crate::error::{PipelibError, PipelibResult};
use crate::library::{
    LibrariesRecord, LibraryCatalog, LibraryConfiguration, LibraryReference,
    ResolvedLibraryRecord,
};
use crate::resolve::VersionResolver;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Directory under the build holding materialized libraries
pub const LIBS_DIR: &str = "libs";

/// Directory inside a library holding its global script entries
const SYMBOLS_DIR: &str = "vars";
const SYMBOL_EXTENSION: &str = "groovy";

/// A library materialized into a build
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedLibrary {
    pub record: ResolvedLibraryRecord,
    /// `None` when the build already had the library from an earlier run
    pub outcome: Option<CacheOutcome>,
    pub path: PathBuf,
}

/// Result for one requested library
#[derive(Debug)]
pub struct LibraryResult {
    pub reference: LibraryReference,
    pub result: PipelibResult<RetrievedLibrary>,
}

/// Results for every library of a build, in plan order
#[derive(Debug, Default)]
pub struct BuildReport {
    pub libraries: Vec<LibraryResult>,
}

impl BuildReport {
    pub fn failures(&self) -> usize {
        self.libraries.iter().filter(|l| l.result.is_err()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failures() == 0
    }
}

/// Resolves and materializes libraries for builds
#[derive(Debug)]
pub struct RetrievalPipeline {
    catalog: LibraryCatalog,
    namer: DirectoryNamer,
    coordinator: CacheCoordinator,
}

impl RetrievalPipeline {
    pub fn new(
        catalog: LibraryCatalog,
        namer: DirectoryNamer,
        coordinator: CacheCoordinator,
    ) -> Self {
        Self {
            catalog,
            namer,
            coordinator,
        }
    }

    /// Build a pipeline over the configured providers and cache
    pub fn from_config(config: &Config, locks: Arc<LockRegistry>) -> PipelibResult<Self> {
        let namer = DirectoryNamer::load_or_create(&ConfigManager::secret_key_path(config))?;
        let coordinator = CacheCoordinator::new(
            ConfigManager::cache_root(config),
            locks,
            config.cache.retry_policy(),
        );
        Ok(Self::new(
            LibraryCatalog::from_config(&config.providers),
            namer,
            coordinator,
        ))
    }

    pub fn catalog(&self) -> &LibraryCatalog {
        &self.catalog
    }

    pub fn coordinator(&self) -> &CacheCoordinator {
        &self.coordinator
    }

    /// Libraries a build loads: implicit libraries not referenced
    /// explicitly, then the explicit references. Repeated names keep the
    /// first reference.
    pub fn plan(&self, references: &[LibraryReference]) -> Vec<LibraryReference> {
        let mut seen = HashSet::new();
        let mut explicit = Vec::new();
        for reference in references {
            if seen.insert(reference.name.as_str()) {
                explicit.push(reference.clone());
            } else {
                warn!(
                    "Library {} referenced more than once, ignoring {}",
                    reference.name, reference
                );
            }
        }

        let mut plan: Vec<LibraryReference> = self
            .catalog
            .implicit()
            .into_iter()
            .filter(|(_, library)| !seen.contains(library.name.as_str()))
            .map(|(_, library)| LibraryReference::new(library.name.clone(), None))
            .collect();
        plan.extend(explicit);
        plan
    }

    /// Resolve `reference` to a record without fetching anything
    pub fn resolve(
        &self,
        reference: &LibraryReference,
        ctx: &BuildContext,
    ) -> PipelibResult<ResolvedLibraryRecord> {
        let (provider, library) = self
            .catalog
            .find(&reference.name)
            .ok_or_else(|| PipelibError::LibraryNotFound(reference.name.clone()))?;

        let version = VersionResolver::new(library).resolve(reference.version.as_deref(), ctx)?;
        ResolvedLibraryRecord::new(
            &self.namer,
            &library.name,
            &version,
            provider.trusted,
            library.flags.include_changelog,
            library.caching.clone(),
            &provider.id,
            library.retriever.sub_path(),
        )
    }

    /// Resolve and materialize one library into `build_dir`
    pub fn retrieve(
        &self,
        reference: &LibraryReference,
        build_dir: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<RetrievedLibrary> {
        let record = self.resolve(reference, ctx)?;
        let library = self.configuration(record.name())?;
        self.materialize(record, library, build_dir, ctx)
    }

    /// Bring back a library recorded by an earlier run of the build
    fn resume(
        &self,
        record: ResolvedLibraryRecord,
        build_dir: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<RetrievedLibrary> {
        let path = library_dir(build_dir, &record);
        if path.is_dir() {
            ctx.trace.record(format!(
                "Reusing {}@{} recorded by an earlier run",
                record.name(),
                record.version()
            ));
            return Ok(RetrievedLibrary {
                record,
                outcome: None,
                path,
            });
        }

        ctx.trace.record(format!(
            "Recorded {}@{} is missing from the build; materializing again",
            record.name(),
            record.version()
        ));
        let library = self.configuration(record.name())?;
        self.materialize(record, library, build_dir, ctx)
    }

    fn configuration(&self, name: &str) -> PipelibResult<&LibraryConfiguration> {
        self.catalog
            .find(name)
            .map(|(_, library)| library)
            .ok_or_else(|| PipelibError::LibraryNotFound(name.to_string()))
    }

    fn materialize(
        &self,
        mut record: ResolvedLibraryRecord,
        library: &LibraryConfiguration,
        build_dir: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<RetrievedLibrary> {
        let path = library_dir(build_dir, &record);
        let outcome = self
            .coordinator
            .materialize(&record, library.retriever.as_ref(), &path, ctx)?;
        record.add_symbols(discover_symbols(&path)?);

        info!(
            "Loaded {}@{} ({}) with {} symbols",
            record.name(),
            record.version(),
            outcome,
            record.symbols().len()
        );
        Ok(RetrievedLibrary {
            record,
            outcome: Some(outcome),
            path,
        })
    }

    /// Retrieve every library of a build concurrently and save the
    /// build's record
    pub fn retrieve_all(
        &self,
        references: &[LibraryReference],
        build_dir: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<BuildReport> {
        let mut saved = LibrariesRecord::load(build_dir)?;
        let plan = self.plan(references);

        let libraries: Vec<LibraryResult> = std::thread::scope(|scope| {
            let handles: Vec<_> = plan
                .into_iter()
                .map(|reference| {
                    let previous = saved.get(&reference.name).cloned();
                    let worker = reference.clone();
                    let handle = scope.spawn(move || match previous {
                        Some(record) => self.resume(record, build_dir, ctx),
                        None => self.retrieve(&worker, build_dir, ctx),
                    });
                    (reference, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(reference, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(PipelibError::Internal(format!(
                            "retrieval of {} panicked",
                            reference.name
                        )))
                    });
                    LibraryResult { reference, result }
                })
                .collect()
        });

        for library in &libraries {
            match &library.result {
                Ok(retrieved) => {
                    let record = retrieved.record.clone();
                    if let Some(existing) = saved.get_mut(record.name()) {
                        existing.add_symbols(record.symbols().iter().cloned());
                    } else {
                        saved.insert(record);
                    }
                }
                Err(e) => warn!("Library {} failed: {}", library.reference, e),
            }
        }
        saved.save(build_dir)?;
        debug!("Saved {} library records", saved.libraries.len());

        Ok(BuildReport { libraries })
    }
}

/// Where a record's artifact lives inside the build
pub fn library_dir(build_dir: &Path, record: &ResolvedLibraryRecord) -> PathBuf {
    build_dir.join(LIBS_DIR).join(record.directory_name())
}

/// Names of the top-level script entries a library exposes
pub fn discover_symbols(library_dir: &Path) -> PipelibResult<Vec<String>> {
    let dir = library_dir.join(SYMBOLS_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelibError::io(format!("reading {}", dir.display()), e)),
    };

    let mut symbols = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| PipelibError::io(format!("reading {}", dir.display()), e))?
            .path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(SYMBOL_EXTENSION) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            symbols.push(stem.to_string());
        }
    }
    symbols.sort();
    Ok(symbols)
}
