//! Cache command - inspect and clean the shared library cache

use super::blocking;
use crate::cache::{
    list_entries, CacheJanitor, CacheListing, EvictionRequest, EvictionStatus, LockRegistry,
    ManualEviction,
};
use crate::cancel::CancelToken;
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{PipelibError, PipelibResult};
use chrono::Utc;
use console::style;
use std::path::PathBuf;
use std::time::Duration;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> PipelibResult<()> {
    let root = ConfigManager::cache_root(config);

    match args.action {
        CacheAction::List { format } => list_cache(root, format).await,
        CacheAction::Evict {
            name,
            versions,
            force,
        } => evict(root, config, name, versions, force).await,
        CacheAction::Gc { days, dry_run } => gc_cache(root, config, days, dry_run).await,
    }
}

/// List all cache entries
async fn list_cache(root: PathBuf, format: OutputFormat) -> PipelibResult<()> {
    let listing_root = root.clone();
    let entries = blocking("cache list", move || list_entries(&listing_root)).await?;

    if entries.is_empty() && format != OutputFormat::Json {
        println!("No cache entries found in {}.", root.display());
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_cache_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => print_cache_plain(&entries),
    }

    Ok(())
}

fn print_cache_table(entries: &[CacheListing]) {
    println!(
        "{:<16} {:<20} {:<20} {:<20}",
        "ENTRY", "LIBRARY", "VERSION", "LAST READ"
    );
    println!("{}", "-".repeat(80));

    let now = Utc::now();
    for entry in entries {
        let last_read = match entry.last_read {
            Some(at) => {
                let days = (now - at).num_days();
                let text = at.format("%Y-%m-%d %H:%M").to_string();
                if days >= 7 {
                    style(text).yellow().to_string()
                } else {
                    text
                }
            }
            None => style("never").dim().to_string(),
        };

        println!(
            "{:<16} {:<20} {:<20} {:<20}",
            entry.key.get(..12).unwrap_or(&entry.key),
            entry.name.as_deref().unwrap_or("?"),
            entry.version.as_deref().unwrap_or("?"),
            last_read
        );
    }

    println!();
    println!("Total: {} entr{}", entries.len(), if entries.len() == 1 { "y" } else { "ies" });
}

fn print_cache_plain(entries: &[CacheListing]) {
    for entry in entries {
        println!("{}", entry.key);
    }
}

/// Remove cached versions of one library
async fn evict(
    root: PathBuf,
    config: &Config,
    name: String,
    versions: Option<String>,
    force: bool,
) -> PipelibResult<()> {
    let eviction =
        ManualEviction::new(root, LockRegistry::global(), config.cache.eviction_timeout());
    let request = EvictionRequest {
        library_name: name,
        versions,
        force,
    };

    let response = blocking("cache evict", move || Ok(eviction.evict(&request))).await?;

    match response.status {
        EvictionStatus::Ok => {
            println!("{} {}", style("✓").green(), response.message);
            Ok(())
        }
        EvictionStatus::Error => Err(PipelibError::User(response.message)),
    }
}

/// Remove entries not read within the retention window
async fn gc_cache(
    root: PathBuf,
    config: &Config,
    days_override: Option<u64>,
    dry_run: bool,
) -> PipelibResult<()> {
    let days = days_override.unwrap_or(config.cache.retention_days);
    let retention = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
    let janitor = CacheJanitor::new(root, LockRegistry::global(), retention);

    let report = blocking("cache gc", move || janitor.sweep(dry_run, &CancelToken::new())).await?;

    if report.removed() == 0 {
        println!("No cache entries unread for more than {} days.", days);
        return Ok(());
    }

    let verb = if dry_run { "Would remove" } else { "Removed" };
    for key in &report.expired {
        println!("  {} {}", style("-").red(), key);
    }
    for path in &report.legacy {
        println!("  {} {} (old layout)", style("-").red(), path.display());
    }
    println!();
    println!(
        "{} {} entr{}, kept {}",
        verb,
        report.removed(),
        if report.removed() == 1 { "y" } else { "ies" },
        report.retained
    );

    Ok(())
}
