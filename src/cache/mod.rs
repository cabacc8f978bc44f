//! Shared on-disk cache of library artifacts
//!
//! Every resolved library version maps to one directory under the cache
//! root, named by [`DirectoryNamer`]. Builds on the same host reuse that
//! directory instead of fetching again.
//!
//! # Concurrency
//!
//! Each directory name has one shared/exclusive lock in the process-wide
//! [`LockRegistry`]:
//!
//! | Actor | Lock | Purpose |
//! |-------|------|---------|
//! | Build reading a valid entry | shared | copy into the build |
//! | Build filling or refreshing | exclusive, then downgraded | fetch and publish |
//! | Janitor | exclusive | delete unread entries |
//! | Manual eviction | exclusive with timeout, or none when forced | operator cleanup |

pub mod coordinator;
pub mod entry;
pub mod eviction;
pub mod janitor;
pub mod lock;
pub mod namer;

pub use coordinator::{CacheCoordinator, CacheOutcome};
pub use entry::{list_entries, CacheEntry, CacheListing, CacheState};
pub use eviction::{EvictedEntry, EvictionRequest, EvictionResponse, EvictionStatus, ManualEviction};
pub use janitor::{CacheJanitor, JanitorHandle, SweepReport};
pub use lock::LockRegistry;
pub use namer::DirectoryNamer;
