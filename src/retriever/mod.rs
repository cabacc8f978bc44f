//! Library retrievers
//!
//! A retriever knows how to fetch one library version from its
//! authoritative source and how to tell whether a version exists there.
//! Implementations are a closed set selected by static configuration:
//!
//! | Kind | Source | Validation |
//! |------|--------|------------|
//! | `directory` | `<root>/<version>/` on local disk | directory exists |
//! | `git` | remote repository, shallow clone | `git ls-remote` |

mod directory;
mod git;

pub use directory::DirectoryRetriever;
pub use git::{GitRetriever, GitWorkspace};

use crate::cancel::CancelToken;
use crate::context::BuildContext;
use crate::error::PipelibResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Result of asking a retriever whether a version exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionCheck {
    /// The version exists and can be fetched
    Ok,
    /// The retriever could not confirm the version
    Warning(String),
    /// The version does not exist
    Error(String),
}

impl VersionCheck {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for VersionCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning(msg) => write!(f, "warning: {}", msg),
            Self::Error(msg) => write!(f, "error: {}", msg),
        }
    }
}

/// One fetch of one library version
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub name: &'a str,
    pub version: &'a str,
    /// Attribute the library's changes to the consuming build. Retrievers
    /// that know the fetched revision record it in the build trace.
    pub changelog: bool,
    /// Directory to create and fill; must not exist yet
    pub destination: &'a Path,
}

/// Fetch capability every retriever provides.
///
/// `fetch` must either fill `destination` completely or fail; callers
/// stage the destination and publish it themselves.
pub trait Retriever: Send + Sync + fmt::Debug {
    /// Fetch a library version into `request.destination`
    fn fetch(&self, request: &FetchRequest<'_>, ctx: &BuildContext) -> PipelibResult<()>;

    /// Check whether `version` exists for library `name`
    fn validate_version(&self, name: &str, version: &str, ctx: &BuildContext) -> VersionCheck;

    /// Sub-path within the source that holds the library, if any
    fn sub_path(&self) -> Option<&str> {
        None
    }

    /// Short name for logs
    fn kind(&self) -> &'static str;
}

/// Optional capability of source-control collaborators that know which
/// branch a build is running on.
pub trait BranchAware: Send + Sync {
    /// The current branch, or `None` when it cannot be determined
    fn current_branch(&self, ctx: &BuildContext) -> Option<String>;
}

/// Configured retriever variants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LibraryRetriever {
    Directory(DirectoryRetriever),
    Git(GitRetriever),
}

impl Retriever for LibraryRetriever {
    fn fetch(&self, request: &FetchRequest<'_>, ctx: &BuildContext) -> PipelibResult<()> {
        match self {
            Self::Directory(r) => r.fetch(request, ctx),
            Self::Git(r) => r.fetch(request, ctx),
        }
    }

    fn validate_version(&self, name: &str, version: &str, ctx: &BuildContext) -> VersionCheck {
        match self {
            Self::Directory(r) => r.validate_version(name, version, ctx),
            Self::Git(r) => r.validate_version(name, version, ctx),
        }
    }

    fn sub_path(&self) -> Option<&str> {
        match self {
            Self::Directory(r) => r.sub_path(),
            Self::Git(r) => r.sub_path(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Directory(r) => r.kind(),
            Self::Git(r) => r.kind(),
        }
    }
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent.
    pub fn run<T>(
        &self,
        what: &str,
        cancel: &CancelToken,
        mut op: impl FnMut(u32) -> PipelibResult<T>,
    ) -> PipelibResult<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            cancel.check()?;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, attempts, e, self.delay
                    );
                    cancel.sleep(self.delay)?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelibError;
    use std::cell::Cell;

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn retry_stops_on_success() {
        let calls = Cell::new(0);
        let value = quick(3)
            .run("fetch", &CancelToken::new(), |attempt| {
                calls.set(calls.get() + 1);
                if attempt < 2 {
                    Err(PipelibError::fetch("utils", "reset"))
                } else {
                    Ok(attempt)
                }
            })
            .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn retry_gives_up_after_budget() {
        let calls = Cell::new(0);
        let result: PipelibResult<()> = quick(3).run("fetch", &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(PipelibError::fetch("utils", "reset"))
        });
        assert!(matches!(result, Err(PipelibError::FetchFailure { .. })));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retry_does_not_repeat_fatal_errors() {
        let calls = Cell::new(0);
        let result: PipelibResult<()> = quick(5).run("fetch", &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(PipelibError::IntegrityError("symlink".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_honours_cancellation() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = quick(3).run("fetch", &cancel, |_| Ok(()));
        assert!(matches!(result, Err(PipelibError::Cancelled)));
    }

    #[test]
    fn retriever_config_is_tagged() {
        let retriever: LibraryRetriever = toml::from_str(
            r#"
                kind = "git"
                remote = "https://example.com/shared.git"
                library_path = "pipeline"
            "#,
        )
        .unwrap();
        assert_eq!(retriever.kind(), "git");
        assert_eq!(retriever.sub_path(), Some("pipeline"));
    }
}
