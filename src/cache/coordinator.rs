//! Shared-cache coordination for library artifacts
//!
//! Readers take the key's shared lock and serve valid entries concurrently.
//! A missing or expired entry is filled under the exclusive lock by the
//! first thread to get it; everyone else re-checks and finds it valid. The
//! filler downgrades to the shared lock before copying, so the entry is
//! never unprotected between fetch and read.
//!
//! The shared lock is held until the copy into the build finishes. The
//! janitor needs the exclusive lock to delete, so it cannot remove an
//! entry mid-copy. Locks span processes, so this holds between separate
//! builds and operator commands on one cache root as well. Converting the
//! file lock on downgrade is not atomic across processes, so the entry is
//! checked again once the shared lock is back.

use super::entry::{CacheEntry, CacheState, NameMarker};
use super::lock::LockRegistry;
use crate::context::BuildContext;
use crate::error::{PipelibError, PipelibResult};
use crate::fsutil::{copy_dir, remove_path};
use crate::library::ResolvedLibraryRecord;
use crate::retriever::{FetchRequest, RetryPolicy, Retriever};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// How a library ended up in the build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    /// Served from a valid cache entry
    Hit,
    /// Fetched into a new cache entry
    Filled,
    /// Expired entry deleted and refetched
    Refreshed,
    /// Version excluded from caching; fetched straight into the build
    Bypassed,
    /// Caching disabled for the library; fetched straight into the build
    Uncached,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::Filled => write!(f, "miss"),
            Self::Refreshed => write!(f, "expired"),
            Self::Bypassed => write!(f, "excluded"),
            Self::Uncached => write!(f, "uncached"),
        }
    }
}

/// Guards reads and fills of the shared cache
#[derive(Debug, Clone)]
pub struct CacheCoordinator {
    root: PathBuf,
    locks: Arc<LockRegistry>,
    retry: RetryPolicy,
}

impl CacheCoordinator {
    pub fn new(root: impl Into<PathBuf>, locks: Arc<LockRegistry>, retry: RetryPolicy) -> Self {
        Self {
            root: root.into(),
            locks,
            retry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    /// Put the record's artifact at `target`, going through the shared
    /// cache when the record's policy allows it.
    pub fn materialize(
        &self,
        record: &ResolvedLibraryRecord,
        retriever: &dyn Retriever,
        target: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<CacheOutcome> {
        let key = record.directory_name();

        let Some(policy) = record.caching() else {
            // Not shared across builds, but concurrent fetches of the same
            // key are still serialized
            let lock = self.locks.lock_for(&self.root, key);
            let _exclusive = lock.write_interruptibly(&ctx.cancel)?;
            ctx.trace.record(format!(
                "Caching disabled for {}; fetching {} into the build",
                record.name(),
                record.version()
            ));
            self.fetch_to(record, retriever, target, ctx)?;
            return Ok(CacheOutcome::Uncached);
        };

        if policy.is_excluded(record.version()) {
            ctx.trace.record(format!(
                "Version {} of {} is excluded from caching; fetching into the build",
                record.version(),
                record.name()
            ));
            self.fetch_to(record, retriever, target, ctx)?;
            return Ok(CacheOutcome::Bypassed);
        }

        fs::create_dir_all(&self.root)
            .map_err(|e| PipelibError::io(format!("creating {}", self.root.display()), e))?;

        let entry = CacheEntry::new(&self.root, key);
        let lock = self.locks.lock_for(&self.root, key);

        let (shared, outcome) = loop {
            let shared = lock.read_interruptibly(&ctx.cancel)?;
            if entry.state(policy, SystemTime::now())? == CacheState::Valid {
                break (shared, CacheOutcome::Hit);
            }
            drop(shared);

            let exclusive = lock.write_interruptibly(&ctx.cancel)?;
            let outcome = match entry.state(policy, SystemTime::now())? {
                CacheState::Valid => {
                    debug!("Cache entry {} was filled while waiting", key);
                    CacheOutcome::Hit
                }
                CacheState::Expired => {
                    ctx.trace.record(format!(
                        "Cached {}@{} is older than {} minutes; refreshing",
                        record.name(),
                        record.version(),
                        policy.refresh_minutes
                    ));
                    entry.remove()?;
                    self.fill(&entry, record, retriever, ctx)?;
                    CacheOutcome::Refreshed
                }
                CacheState::Missing => {
                    ctx.trace.record(format!(
                        "No cached copy of {}@{}; fetching",
                        record.name(),
                        record.version()
                    ));
                    self.fill(&entry, record, retriever, ctx)?;
                    CacheOutcome::Filled
                }
            };

            let shared = exclusive.downgrade(&ctx.cancel)?;
            if entry.exists() {
                break (shared, outcome);
            }
            debug!("Cache entry {} was removed during downgrade; retrying", key);
        };

        if outcome == CacheOutcome::Hit {
            ctx.trace.record(format!(
                "Using cached {}@{} ({})",
                record.name(),
                record.version(),
                key
            ));
        }

        entry.touch_last_read()?;
        let source = entry.artifact_path();
        self.retry.run("copying cached library", &ctx.cancel, |_| {
            remove_path(target)?;
            copy_dir(&source, target)
        })?;
        drop(shared);

        Ok(outcome)
    }

    /// Fetch into a staging directory and publish it under the entry's key
    fn fill(
        &self,
        entry: &CacheEntry,
        record: &ResolvedLibraryRecord,
        retriever: &dyn Retriever,
        ctx: &BuildContext,
    ) -> PipelibResult<()> {
        let staging = entry.staging_path();
        let result = self
            .fetch_with_retry(record, retriever, &staging, ctx)
            .and_then(|()| publish(&staging, entry));

        if let Err(e) = result {
            remove_path(&staging)?;
            return Err(e);
        }

        entry.write_name_marker(&NameMarker {
            name: record.name().to_string(),
            version: record.version().to_string(),
        })?;
        info!(
            "Cached {}@{} as {}",
            record.name(),
            record.version(),
            entry.key()
        );
        Ok(())
    }

    /// Fetch directly into the build-local target
    fn fetch_to(
        &self,
        record: &ResolvedLibraryRecord,
        retriever: &dyn Retriever,
        target: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| PipelibError::io(format!("creating {}", parent.display()), e))?;
        }
        remove_path(target)?;
        let result = self.fetch_with_retry(record, retriever, target, ctx);
        if result.is_err() {
            remove_path(target)?;
        }
        result
    }

    fn fetch_with_retry(
        &self,
        record: &ResolvedLibraryRecord,
        retriever: &dyn Retriever,
        destination: &Path,
        ctx: &BuildContext,
    ) -> PipelibResult<()> {
        let what = format!("fetching {}@{}", record.name(), record.version());
        self.retry.run(&what, &ctx.cancel, |attempt| {
            debug!("{} via {} (attempt {})", what, retriever.kind(), attempt);
            remove_path(destination)?;
            let request = FetchRequest {
                name: record.name(),
                version: record.version(),
                changelog: record.changelog(),
                destination,
            };
            retriever.fetch(&request, ctx)
        })
    }
}

/// Rename a finished staging directory to the entry's final name. An
/// artifact that appeared meanwhile was published by another process and
/// is kept.
fn publish(staging: &Path, entry: &CacheEntry) -> PipelibResult<()> {
    match fs::rename(staging, entry.artifact_path()) {
        Ok(()) => Ok(()),
        Err(_) if entry.exists() => {
            debug!("Cache entry {} was published by another process", entry.key());
            remove_path(staging)
        }
        Err(e) => Err(PipelibError::io(
            format!("publishing cache entry {}", entry.key()),
            e,
        )),
    }
}
