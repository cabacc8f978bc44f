//! Background expiry of unread cache entries
//!
//! An entry whose last-read marker is older than the retention window is
//! deleted under its exclusive lock. Entries without a marker are never
//! touched. Directories in the old two-level layout (a library directory
//! containing version directories with a `last_read` file) can never be
//! read again and are removed unconditionally. Only names that cannot be
//! current directory names are checked for that layout, since a library's
//! own files may include a `last_read`.

use super::entry::{entry_keys, CacheEntry};
use super::lock::LockRegistry;
use super::namer::is_directory_name;
use crate::cancel::CancelToken;
use crate::error::{PipelibError, PipelibResult};
use crate::fsutil::remove_path;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Marker file name inside version directories of the old layout
const LEGACY_LAST_READ: &str = "last_read";

/// Default retention window
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default sweep period
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// What one sweep did (or would do, in a dry run)
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Keys of expired entries
    pub expired: Vec<String>,
    /// Directories in the old layout
    pub legacy: Vec<PathBuf>,
    /// Entries kept
    pub retained: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired.len() + self.legacy.len()
    }
}

/// Expires cache entries that have not been read within the retention window
#[derive(Debug, Clone)]
pub struct CacheJanitor {
    root: PathBuf,
    locks: Arc<LockRegistry>,
    retention: Duration,
}

impl CacheJanitor {
    pub fn new(root: impl Into<PathBuf>, locks: Arc<LockRegistry>, retention: Duration) -> Self {
        Self {
            root: root.into(),
            locks,
            retention,
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Run one pass over the cache root
    pub fn sweep(&self, dry_run: bool, cancel: &CancelToken) -> PipelibResult<SweepReport> {
        let mut report = SweepReport::default();

        for key in entry_keys(&self.root)? {
            cancel.check()?;
            let entry = CacheEntry::new(&self.root, key.clone());

            if !is_directory_name(&key) && is_legacy_layout(&entry.artifact_path()) {
                if !dry_run {
                    info!("Removing cache directory in old layout: {}", key);
                    remove_path(&entry.artifact_path())?;
                }
                report.legacy.push(entry.artifact_path());
                continue;
            }

            if !self.is_stale(&entry)? {
                report.retained += 1;
                continue;
            }

            if dry_run {
                report.expired.push(key);
                continue;
            }

            let lock = self.locks.lock_for(&self.root, &key);
            let _exclusive = lock.write_interruptibly(cancel)?;
            // A build may have read it while we waited
            if !self.is_stale(&entry)? {
                debug!("Cache entry {} was read during sweep, keeping", key);
                report.retained += 1;
                continue;
            }
            info!("Expiring cache entry {}", key);
            entry.remove()?;
            report.expired.push(key);
        }

        Ok(report)
    }

    fn is_stale(&self, entry: &CacheEntry) -> PipelibResult<bool> {
        Ok(matches!(
            entry.last_read_age(SystemTime::now())?,
            Some(age) if age > self.retention
        ))
    }

    /// Sweep every `period` on a background thread until stopped
    pub fn spawn(self, period: Duration) -> PipelibResult<JanitorHandle> {
        let cancel = CancelToken::new();
        let thread_cancel = cancel.clone();
        let thread = std::thread::Builder::new()
            .name("pipelib-janitor".to_string())
            .spawn(move || loop {
                match self.sweep(false, &thread_cancel) {
                    Ok(report) => debug!(
                        "Janitor sweep removed {} entries, kept {}",
                        report.removed(),
                        report.retained
                    ),
                    Err(PipelibError::Cancelled) => break,
                    Err(e) => warn!("Janitor sweep failed: {}", e),
                }
                if thread_cancel.sleep(period).is_err() {
                    break;
                }
            })
            .map_err(|e| PipelibError::io("spawning janitor thread", e))?;

        Ok(JanitorHandle {
            cancel,
            thread: Some(thread),
        })
    }
}

/// Whether `dir` is a library directory of the old two-level layout
fn is_legacy_layout(dir: &Path) -> bool {
    let Ok(children) = fs::read_dir(dir) else {
        return false;
    };
    children.flatten().any(|child| {
        child.file_type().map(|t| t.is_dir()).unwrap_or(false)
            && child.path().join(LEGACY_LAST_READ).is_file()
    })
}

/// Running janitor thread; stops when dropped
#[derive(Debug)]
pub struct JanitorHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl JanitorHandle {
    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Janitor thread panicked");
            }
        }
    }
}

impl Drop for JanitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::backdate;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn entry_with_marker(root: &Path, key: &str, last_read_ago: Option<Duration>) -> CacheEntry {
        let entry = CacheEntry::new(root, key);
        fs::create_dir_all(entry.artifact_path().join("vars")).unwrap();
        if let Some(ago) = last_read_ago {
            entry.touch_last_read().unwrap();
            backdate(&entry.last_read_path(), ago);
        }
        entry
    }

    fn janitor(temp: &TempDir) -> CacheJanitor {
        CacheJanitor::new(temp.path(), Arc::new(LockRegistry::new()), DEFAULT_RETENTION)
    }

    #[test]
    fn expires_only_stale_entries() {
        let temp = TempDir::new().unwrap();
        let stale = entry_with_marker(temp.path(), "stale", Some(DAY * 8));
        let fresh = entry_with_marker(temp.path(), "fresh", Some(DAY));
        let unmarked = entry_with_marker(temp.path(), "unmarked", None);
        backdate(&unmarked.artifact_path(), DAY * 365);

        let report = janitor(&temp).sweep(false, &CancelToken::new()).unwrap();

        assert_eq!(report.expired, vec!["stale".to_string()]);
        assert_eq!(report.retained, 2);
        assert!(!stale.exists());
        assert!(!stale.last_read_path().exists());
        assert!(fresh.exists());
        assert!(unmarked.exists());
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let temp = TempDir::new().unwrap();
        let stale = entry_with_marker(temp.path(), "stale", Some(DAY * 30));

        let report = janitor(&temp).sweep(true, &CancelToken::new()).unwrap();

        assert_eq!(report.expired, vec!["stale".to_string()]);
        assert!(stale.exists());
    }

    #[test]
    fn removes_legacy_layout_unconditionally() {
        let temp = TempDir::new().unwrap();
        let legacy = temp.path().join("oldlib");
        fs::create_dir_all(legacy.join("v1")).unwrap();
        fs::write(legacy.join("v1").join(LEGACY_LAST_READ), "").unwrap();

        let report = janitor(&temp).sweep(false, &CancelToken::new()).unwrap();

        assert_eq!(report.legacy, vec![legacy.clone()]);
        assert!(!legacy.exists());
    }

    #[test]
    fn waits_for_readers_before_deleting() {
        let temp = TempDir::new().unwrap();
        let locks = Arc::new(LockRegistry::new());
        let stale = entry_with_marker(temp.path(), "stale", Some(DAY * 8));
        let janitor = CacheJanitor::new(temp.path(), Arc::clone(&locks), DEFAULT_RETENTION);

        let lock = locks.lock_for(temp.path(), "stale");
        let reader = lock.read_interruptibly(&CancelToken::new()).unwrap();
        let cancel = CancelToken::new();

        std::thread::scope(|scope| {
            let sweep = scope.spawn(|| janitor.sweep(false, &cancel));
            std::thread::sleep(Duration::from_millis(150));
            assert!(stale.exists(), "entry deleted while a reader held it");
            drop(reader);
            let report = sweep.join().unwrap().unwrap();
            assert_eq!(report.expired.len(), 1);
        });
        assert!(!stale.exists());
    }

    #[test]
    fn current_entries_with_last_read_files_are_not_legacy() {
        let temp = TempDir::new().unwrap();
        let key = "a".repeat(64);
        let entry = entry_with_marker(temp.path(), &key, Some(DAY));
        fs::create_dir_all(entry.artifact_path().join("resources")).unwrap();
        fs::write(entry.artifact_path().join("resources/last_read"), "").unwrap();

        let report = janitor(&temp).sweep(false, &CancelToken::new()).unwrap();

        assert!(report.legacy.is_empty());
        assert_eq!(report.retained, 1);
        assert!(entry.exists());
    }

    // A reader in another pipelib process holds the entry
    #[cfg(unix)]
    #[test]
    fn waits_for_readers_in_other_processes() {
        let temp = TempDir::new().unwrap();
        let stale = entry_with_marker(temp.path(), "stale", Some(DAY * 8));
        let build_locks = LockRegistry::new();
        let lock = build_locks.lock_for(temp.path(), "stale");
        let reader = lock.read_interruptibly(&CancelToken::new()).unwrap();
        let janitor = janitor(&temp);
        let cancel = CancelToken::new();

        std::thread::scope(|scope| {
            let sweep = scope.spawn(|| janitor.sweep(false, &cancel));
            std::thread::sleep(Duration::from_millis(150));
            assert!(stale.exists(), "entry deleted while another process read it");
            drop(reader);
            let report = sweep.join().unwrap().unwrap();
            assert_eq!(report.expired.len(), 1);
        });
        assert!(!stale.exists());
    }

    #[test]
    fn spawned_janitor_stops() {
        let temp = TempDir::new().unwrap();
        let stale = entry_with_marker(temp.path(), "stale", Some(DAY * 8));

        let handle = janitor(&temp).spawn(Duration::from_secs(3600)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while stale.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        handle.stop();

        assert!(!stale.exists());
    }
}
