//! CLI command implementations

pub mod cache;
pub mod config;
pub mod janitor;
pub mod resolve;

pub use cache::execute as cache;
pub use config::execute as config;
pub use janitor::execute as janitor;
pub use resolve::execute as resolve;

use crate::error::{PipelibError, PipelibResult};

/// Run blocking cache work off the async runtime
pub(crate) async fn blocking<T, F>(what: &str, work: F) -> PipelibResult<T>
where
    F: FnOnce() -> PipelibResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelibError::Internal(format!("{} worker failed: {}", what, e)))?
}
