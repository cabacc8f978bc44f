//! Janitor command - periodic cache expiry until interrupted

use super::blocking;
use crate::cache::{CacheJanitor, LockRegistry};
use crate::cli::args::JanitorArgs;
use crate::config::{Config, ConfigManager};
use crate::error::{PipelibError, PipelibResult};
use console::style;
use std::time::Duration;
use tracing::info;

/// Execute the janitor command
pub async fn execute(args: JanitorArgs, config: &Config) -> PipelibResult<()> {
    let period = match args.interval_hours {
        Some(hours) => Duration::from_secs(hours.max(1).saturating_mul(60 * 60)),
        None => config.cache.sweep_interval(),
    };
    let root = ConfigManager::cache_root(config);

    println!(
        "{} Sweeping {} every {}h (retention {} days). Press Ctrl-C to stop.",
        style("●").green(),
        root.display(),
        period.as_secs() / 3600,
        config.cache.retention_days
    );

    let janitor = CacheJanitor::new(root, LockRegistry::global(), config.cache.retention());
    let handle = janitor.spawn(period)?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| PipelibError::io("waiting for interrupt", e))?;
    info!("Stopping janitor");

    blocking("janitor", move || {
        handle.stop();
        Ok(())
    })
    .await
}
