//! pipelib - pipeline library resolution with a shared cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use pipelib::cli::args::{ConfigAction, ConfigArgs};
use pipelib::cli::{Cli, Commands};
use pipelib::config::{Config, ConfigManager};
use pipelib::error::PipelibResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> PipelibResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    // Writing or locating the config must work even when the file is broken
    let needs_config = !matches!(
        cli.command,
        Commands::Config(ConfigArgs {
            action: Some(ConfigAction::Init { .. } | ConfigAction::Path)
        })
    );
    let config = if needs_config {
        config_manager.load().await?
    } else {
        Config::default()
    };

    init_logging(cli.verbose, &config.general.log_format);

    match cli.command {
        Commands::Resolve(args) => pipelib::cli::commands::resolve(args, &config).await,
        Commands::Cache(args) => pipelib::cli::commands::cache(args, &config).await,
        Commands::Janitor(args) => pipelib::cli::commands::janitor(args, &config).await,
        Commands::Config(args) => {
            pipelib::cli::commands::config(args, &config, &config_manager).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug
fn init_logging(verbose: u8, format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("pipelib=warn"),
        1 => EnvFilter::new("pipelib=info"),
        _ => EnvFilter::new("pipelib=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
