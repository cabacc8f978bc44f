//! Per-key shared/exclusive locks for cache entries
//!
//! A key's lock has two layers. The registry's in-process `RwLock` orders
//! the threads of one pipelib process; an advisory `flock` on
//! `<root>/.locks/<key>.lock` orders the processes sharing a cache root.
//! The in-process layer is always taken first, and every file lock is
//! taken on its own descriptor, so readers in one process share the file
//! lock the same way readers in different processes do.
//!
//! Registry entries are created on first use and never removed, so a
//! lookup can never race with the disposal of the lock it is about to
//! take. Lock files are never deleted either: unlinking a file another
//! process is waiting on would split the key's lock in two.
//!
//! Every acquisition returns an RAII guard, so locks are released on every
//! exit path including errors and cancellation.

use crate::cancel::{CancelToken, POLL_INTERVAL};
use crate::error::{PipelibError, PipelibResult};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Directory under the cache root holding lock files
pub const LOCKS_DIR: &str = ".locks";

/// Waits longer than this are logged as contention
const CONTENTION_WARNING: Duration = Duration::from_millis(500);

static GLOBAL: LazyLock<Arc<LockRegistry>> = LazyLock::new(|| Arc::new(LockRegistry::new()));

/// Insert-only map from lock file to lock
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<KeyLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry shared by pipelines, janitor and eviction
    pub fn global() -> Arc<LockRegistry> {
        Arc::clone(&GLOBAL)
    }

    /// The lock for `key` under cache `root`, created if absent
    pub fn lock_for(&self, root: &Path, key: &str) -> Arc<KeyLock> {
        let path = root.join(LOCKS_DIR).join(format!("{}.lock", key));
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(path.clone()).or_insert_with(|| {
            Arc::new(KeyLock {
                key: key.to_string(),
                path,
                memory: RwLock::new(()),
            })
        }))
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A cache key's lock
#[derive(Debug)]
pub struct KeyLock {
    key: String,
    path: PathBuf,
    memory: RwLock<()>,
}

/// Held shared lock; released on drop
#[must_use]
#[derive(Debug)]
pub struct SharedGuard<'a> {
    _file: FileLock,
    _memory: RwLockReadGuard<'a, ()>,
}

/// Held exclusive lock; released on drop
#[must_use]
#[derive(Debug)]
pub struct ExclusiveGuard<'a> {
    file: FileLock,
    memory: RwLockWriteGuard<'a, ()>,
    lock: &'a KeyLock,
}

impl KeyLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the shared lock, giving up when `cancel` fires
    pub fn read_interruptibly(&self, cancel: &CancelToken) -> PipelibResult<SharedGuard<'_>> {
        let wait = Wait::Cancellable(cancel);
        let memory = self.wait(&wait, "shared", |slice| Ok(self.memory.try_read_for(slice)))?;
        let file = self.lock_file(Mode::Shared, &wait)?;
        Ok(SharedGuard {
            _file: file,
            _memory: memory,
        })
    }

    /// Acquire the exclusive lock, giving up when `cancel` fires
    pub fn write_interruptibly(&self, cancel: &CancelToken) -> PipelibResult<ExclusiveGuard<'_>> {
        self.write(&Wait::Cancellable(cancel))
    }

    /// Acquire the exclusive lock within `timeout`
    pub fn write_within(&self, timeout: Duration) -> PipelibResult<ExclusiveGuard<'_>> {
        self.write(&Wait::Within {
            deadline: Instant::now() + timeout,
            timeout,
        })
    }

    fn write(&self, wait: &Wait<'_>) -> PipelibResult<ExclusiveGuard<'_>> {
        let memory = self.wait(wait, "exclusive", |slice| Ok(self.memory.try_write_for(slice)))?;
        let file = self.lock_file(Mode::Exclusive, wait)?;
        Ok(ExclusiveGuard {
            file,
            memory,
            lock: self,
        })
    }

    fn lock_file(&self, mode: Mode, wait: &Wait<'_>) -> PipelibResult<FileLock> {
        let file = FileLock::open(&self.path)
            .map_err(|e| PipelibError::io(format!("opening {}", self.path.display()), e))?;
        self.wait(wait, mode.describe(), |slice| {
            if file.try_lock(mode).map_err(|e| {
                PipelibError::io(format!("locking {}", self.path.display()), e)
            })? {
                Ok(Some(()))
            } else {
                std::thread::sleep(slice);
                Ok(None)
            }
        })?;
        Ok(file)
    }

    /// Poll `attempt` until it yields, logging contention once
    fn wait<T>(
        &self,
        wait: &Wait<'_>,
        what: &str,
        mut attempt: impl FnMut(Duration) -> PipelibResult<Option<T>>,
    ) -> PipelibResult<T> {
        let start = Instant::now();
        let mut warned = false;
        loop {
            wait.check_cancelled()?;
            if let Some(acquired) = attempt(wait.slice())? {
                if warned {
                    debug!("{} lock on {} acquired after {:?}", what, self.key, start.elapsed());
                }
                return Ok(acquired);
            }
            wait.check_deadline(&self.key)?;
            if !warned && start.elapsed() > CONTENTION_WARNING {
                warn!("Lock contention on cache entry {}, waiting...", self.key);
                warned = true;
            }
        }
    }
}

impl<'a> ExclusiveGuard<'a> {
    /// Trade the exclusive lock for a shared one.
    ///
    /// Other threads of this process never see the key unlocked. Another
    /// process may take the file lock while it is converted, so callers
    /// re-check the entry afterwards.
    pub fn downgrade(self, cancel: &CancelToken) -> PipelibResult<SharedGuard<'a>> {
        let ExclusiveGuard { file, memory, lock } = self;
        let memory = RwLockWriteGuard::downgrade(memory);
        lock.wait(&Wait::Cancellable(cancel), "shared", |slice| {
            if file.try_lock(Mode::Shared).map_err(|e| {
                PipelibError::io(format!("locking {}", lock.path.display()), e)
            })? {
                Ok(Some(()))
            } else {
                std::thread::sleep(slice);
                Ok(None)
            }
        })?;
        Ok(SharedGuard {
            _file: file,
            _memory: memory,
        })
    }
}

/// How long an acquisition may wait
enum Wait<'c> {
    Cancellable(&'c CancelToken),
    Within { deadline: Instant, timeout: Duration },
}

impl Wait<'_> {
    fn check_cancelled(&self) -> PipelibResult<()> {
        match self {
            Self::Cancellable(cancel) => cancel.check(),
            Self::Within { .. } => Ok(()),
        }
    }

    fn check_deadline(&self, key: &str) -> PipelibResult<()> {
        match self {
            Self::Within { deadline, timeout } if Instant::now() >= *deadline => {
                Err(PipelibError::LockTimeout {
                    key: key.to_string(),
                    timeout: *timeout,
                })
            }
            _ => Ok(()),
        }
    }

    /// How long one attempt may block
    fn slice(&self) -> Duration {
        match self {
            Self::Cancellable(_) => POLL_INTERVAL,
            Self::Within { deadline, .. } => deadline
                .saturating_duration_since(Instant::now())
                .min(POLL_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

impl Mode {
    fn describe(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// Advisory lock on one open descriptor of a lock file
#[derive(Debug)]
struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file })
    }

    /// Take or convert the lock without blocking; `false` when held elsewhere
    #[cfg(unix)]
    fn try_lock(&self, mode: Mode) -> io::Result<bool> {
        use std::os::unix::io::AsRawFd;

        let operation = match mode {
            Mode::Shared => libc::LOCK_SH,
            Mode::Exclusive => libc::LOCK_EX,
        };
        // SAFETY: the descriptor belongs to `self.file`, which is open for
        // the whole call
        let result = unsafe { libc::flock(self.file.as_raw_fd(), operation | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(false),
            _ => Err(err),
        }
    }

    /// Without `flock` only the in-process layer orders access
    #[cfg(not(unix))]
    fn try_lock(&self, _mode: Mode) -> io::Result<bool> {
        Ok(true)
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock too
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still open here
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn registry_reuses_locks() {
        let temp = TempDir::new().unwrap();
        let registry = LockRegistry::new();
        let a = registry.lock_for(temp.path(), "abc");
        let b = registry.lock_for(temp.path(), "abc");
        let c = registry.lock_for(temp.path(), "def");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
        assert_eq!(a.path(), temp.path().join(".locks/abc.lock"));
    }

    #[test]
    fn global_registry_is_shared() {
        let root = Path::new("/nonexistent-pipelib-root");
        let a = LockRegistry::global().lock_for(root, "global-test-key");
        let b = LockRegistry::global().lock_for(root, "global-test-key");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn readers_share() {
        let temp = TempDir::new().unwrap();
        let registry = LockRegistry::new();
        let lock = registry.lock_for(temp.path(), "abc");
        let cancel = CancelToken::new();
        let _r1 = lock.read_interruptibly(&cancel).unwrap();
        let _r2 = lock.read_interruptibly(&cancel).unwrap();
        assert!(lock.path().is_file());
    }

    #[test]
    fn write_within_times_out_while_read_held() {
        let temp = TempDir::new().unwrap();
        let registry = LockRegistry::new();
        let lock = registry.lock_for(temp.path(), "abc");
        let _read = lock.read_interruptibly(&CancelToken::new()).unwrap();

        let err = lock.write_within(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, PipelibError::LockTimeout { .. }));
    }

    // Separate registries stand in for separate pipelib processes
    #[cfg(unix)]
    #[test]
    fn lock_files_exclude_other_registries() {
        let temp = TempDir::new().unwrap();
        let build = LockRegistry::new();
        let operator = LockRegistry::new();

        let reading = build.lock_for(temp.path(), "abc");
        let held = reading.read_interruptibly(&CancelToken::new()).unwrap();

        let other = operator.lock_for(temp.path(), "abc");
        let err = other.write_within(Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, PipelibError::LockTimeout { .. }));
        let _shared = other.read_interruptibly(&CancelToken::new()).unwrap();

        drop(_shared);
        drop(held);
        assert!(other.write_within(Duration::from_millis(100)).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn exclusive_lock_blocks_other_registries_until_released() {
        let temp = TempDir::new().unwrap();
        let first = LockRegistry::new();
        let second = LockRegistry::new();

        let lock = first.lock_for(temp.path(), "abc");
        let exclusive = lock.write_interruptibly(&CancelToken::new()).unwrap();

        let other = second.lock_for(temp.path(), "abc");
        thread::scope(|scope| {
            let waiter = scope.spawn(|| other.read_interruptibly(&CancelToken::new()).map(|_| ()));
            thread::sleep(Duration::from_millis(150));
            assert!(!waiter.is_finished());
            drop(exclusive);
            waiter.join().unwrap().unwrap();
        });
    }

    #[test]
    fn cancellation_unblocks_waiting_writer() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(LockRegistry::new());
        let lock = registry.lock_for(temp.path(), "abc");
        let held = lock.read_interruptibly(&CancelToken::new()).unwrap();

        let cancel = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let registry = Arc::clone(&registry);
            let cancel = cancel.clone();
            let root = temp.path().to_path_buf();
            thread::spawn(move || {
                let lock = registry.lock_for(&root, "abc");
                let result = lock.write_interruptibly(&cancel).map(|_| ());
                tx.send(matches!(result, Err(PipelibError::Cancelled))).unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        cancel.cancel();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        waiter.join().unwrap();
        drop(held);

        // Nothing was left held by the cancelled waiter
        assert!(lock.write_within(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn downgrade_keeps_writers_out() {
        let temp = TempDir::new().unwrap();
        let registry = LockRegistry::new();
        let lock = registry.lock_for(temp.path(), "abc");
        let cancel = CancelToken::new();

        let exclusive = lock.write_interruptibly(&cancel).unwrap();
        let shared = exclusive.downgrade(&cancel).unwrap();

        assert!(lock.write_within(Duration::from_millis(50)).is_err());
        let _reader = lock.read_interruptibly(&cancel).unwrap();
        drop(_reader);
        drop(shared);
        assert!(lock.write_within(Duration::from_millis(50)).is_ok());
    }
}
