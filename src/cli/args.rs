//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// pipelib - pipeline library resolution with a shared cache
///
/// Resolves `name@version` library references for a build and
/// materializes them through a cache shared by every build on the host.
#[derive(Parser, Debug)]
#[command(name = "pipelib")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "PIPELIB_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve and materialize libraries into a build directory
    Resolve(ResolveArgs),

    /// Inspect and clean the shared library cache
    Cache(CacheArgs),

    /// Sweep unread cache entries periodically until interrupted
    Janitor(JanitorArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the resolve command
#[derive(Parser, Debug)]
pub struct ResolveArgs {
    /// Library references (name or name@version)
    pub references: Vec<String>,

    /// Build directory; libraries land in <DIR>/libs
    #[arg(short, long)]
    pub build_dir: PathBuf,

    /// Branch the job is building
    #[arg(long)]
    pub branch: Option<String>,

    /// Build environment variables (KEY=VALUE), on top of the process environment
    #[arg(short, long = "env", value_parser = parse_env_var)]
    pub env: Vec<(String, String)>,

    /// Ignore the process environment
    #[arg(long)]
    pub clean_env: bool,

    /// Git checkout used to detect the current branch
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Print every resolution decision
    #[arg(long)]
    pub trace: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Remove cached versions of a library
    Evict {
        /// Library name
        name: String,

        /// Space-separated versions to remove (default: all)
        #[arg(long)]
        versions: Option<String>,

        /// Delete without waiting for builds using the entry
        #[arg(long)]
        force: bool,
    },

    /// Remove entries not read within the retention window
    Gc {
        /// Override retention_days from config
        #[arg(long)]
        days: Option<u64>,

        /// Show what would be removed without removing
        #[arg(long)]
        dry_run: bool,
    },
}

/// Arguments for the janitor command
#[derive(Parser, Debug)]
pub struct JanitorArgs {
    /// Override sweep_interval_hours from config
    #[arg(long)]
    pub interval_hours: Option<u64>,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Output format for listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Plain,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE format: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_env_var_valid() {
        let (k, v) = parse_env_var("BRANCH_NAME=main").unwrap();
        assert_eq!(k, "BRANCH_NAME");
        assert_eq!(v, "main");
    }

    #[test]
    fn parse_env_var_with_equals() {
        let (k, v) = parse_env_var("FOO=bar=baz").unwrap();
        assert_eq!(k, "FOO");
        assert_eq!(v, "bar=baz");
    }

    #[test]
    fn parse_env_var_invalid() {
        assert!(parse_env_var("FOO").is_err());
    }

    #[test]
    fn cli_parses_resolve() {
        let cli = Cli::parse_from([
            "pipelib",
            "resolve",
            "utils@${BRANCH_NAME}",
            "notify",
            "--build-dir",
            "/tmp/build",
            "-e",
            "BRANCH_NAME=main",
            "--trace",
        ]);
        match cli.command {
            Commands::Resolve(args) => {
                assert_eq!(args.references, vec!["utils@${BRANCH_NAME}", "notify"]);
                assert_eq!(args.env, vec![("BRANCH_NAME".to_string(), "main".to_string())]);
                assert!(args.trace);
                assert_eq!(args.format, OutputFormat::Table);
            }
            _ => panic!("expected Resolve command"),
        }
    }

    #[test]
    fn cli_parses_evict() {
        let cli = Cli::parse_from([
            "pipelib", "cache", "evict", "utils", "--versions", "1.0 2.0", "--force",
        ]);
        match cli.command {
            Commands::Cache(CacheArgs {
                action: CacheAction::Evict { name, versions, force },
            }) => {
                assert_eq!(name, "utils");
                assert_eq!(versions.as_deref(), Some("1.0 2.0"));
                assert!(force);
            }
            _ => panic!("expected cache evict"),
        }
    }

    #[test]
    fn cli_parses_gc() {
        let cli = Cli::parse_from(["pipelib", "cache", "gc", "--days", "3", "--dry-run"]);
        assert!(matches!(
            cli.command,
            Commands::Cache(CacheArgs {
                action: CacheAction::Gc { days: Some(3), dry_run: true }
            })
        ));
    }

    #[test]
    fn cli_parses_config_without_action() {
        let cli = Cli::parse_from(["pipelib", "config"]);
        assert!(matches!(cli.command, Commands::Config(ConfigArgs { action: None })));
    }

    #[test]
    fn resolve_requires_build_dir() {
        assert!(Cli::try_parse_from(["pipelib", "resolve", "utils"]).is_err());
    }
}
