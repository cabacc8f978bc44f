//! Resolve command - materialize a build's libraries

use super::blocking;
use crate::cache::LockRegistry;
use crate::cli::args::{OutputFormat, ResolveArgs};
use crate::config::Config;
use crate::context::{BuildContext, TraceSink};
use crate::error::{PipelibError, PipelibResult};
use crate::library::LibraryReference;
use crate::pipeline::{BuildReport, RetrievalPipeline};
use crate::retriever::GitWorkspace;
use console::style;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Execute the resolve command
pub async fn execute(args: ResolveArgs, config: &Config) -> PipelibResult<()> {
    let references = args
        .references
        .iter()
        .map(|r| LibraryReference::parse(r))
        .collect::<PipelibResult<Vec<_>>>()?;

    let pipeline = RetrievalPipeline::from_config(config, LockRegistry::global())?;
    let ctx = build_context(&args);

    // Ctrl-C interrupts lock waits and retry pauses
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupt received, cancelling retrieval");
            cancel.cancel();
        }
    });

    let build_dir = args.build_dir.clone();
    let worker_ctx = ctx.clone();
    let report = blocking("resolve", move || {
        pipeline.retrieve_all(&references, &build_dir, &worker_ctx)
    })
    .await?;

    match args.format {
        OutputFormat::Table => print_report_table(&report),
        OutputFormat::Json => print_report_json(&report)?,
        OutputFormat::Plain => print_report_plain(&report),
    }

    if ctx.trace.is_enabled() {
        eprintln!();
        for line in ctx.trace.lines() {
            eprintln!("{} {}", style("trace:").dim(), line);
        }
    }

    match report.failures() {
        0 => Ok(()),
        n => Err(PipelibError::User(format!(
            "{} of {} libraries failed",
            n,
            report.libraries.len()
        ))),
    }
}

fn build_context(args: &ResolveArgs) -> BuildContext {
    let mut ctx = BuildContext::new();
    if !args.clean_env {
        ctx.env.extend(std::env::vars());
    }
    ctx.env.extend(args.env.iter().cloned());
    if let Some(branch) = &args.branch {
        ctx = ctx.with_job_branch(branch.clone());
    }
    if let Some(workspace) = &args.workspace {
        ctx = ctx.with_branch_source(Arc::new(GitWorkspace::new(workspace.clone())));
    }
    if args.trace {
        ctx = ctx.with_trace(TraceSink::enabled());
    }
    ctx
}

fn print_report_table(report: &BuildReport) {
    if report.libraries.is_empty() {
        println!("No libraries to load.");
        return;
    }

    println!(
        "{:<20} {:<20} {:<10} {:<16} {}",
        "LIBRARY", "VERSION", "CACHE", "DIRECTORY", "SYMBOLS"
    );
    println!("{}", "-".repeat(80));

    for library in &report.libraries {
        match &library.result {
            Ok(retrieved) => {
                let outcome = match retrieved.outcome {
                    Some(outcome) => style(outcome.to_string()).green().to_string(),
                    None => style("resumed").cyan().to_string(),
                };
                println!(
                    "{:<20} {:<20} {:<10} {:<16} {}",
                    retrieved.record.name(),
                    retrieved.record.version(),
                    outcome,
                    short_key(retrieved.record.directory_name()),
                    retrieved.record.symbols().join(", ")
                );
            }
            Err(e) => {
                println!(
                    "{:<20} {} {}",
                    library.reference.name,
                    style("failed:").red().bold(),
                    e
                );
            }
        }
    }

    println!();
    println!(
        "Loaded {} of {} libraries",
        report.libraries.len() - report.failures(),
        report.libraries.len()
    );
}

fn print_report_json(report: &BuildReport) -> PipelibResult<()> {
    #[derive(Serialize)]
    struct LibraryJson<'a> {
        reference: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        symbols: &'a [String],
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    }

    let json: Vec<LibraryJson> = report
        .libraries
        .iter()
        .map(|library| match &library.result {
            Ok(retrieved) => LibraryJson {
                reference: library.reference.to_string(),
                version: Some(retrieved.record.version()),
                cache: Some(
                    retrieved
                        .outcome
                        .map_or_else(|| "resumed".to_string(), |o| o.to_string()),
                ),
                path: Some(retrieved.path.display().to_string()),
                symbols: retrieved.record.symbols(),
                error: None,
            },
            Err(e) => LibraryJson {
                reference: library.reference.to_string(),
                version: None,
                cache: None,
                path: None,
                symbols: &[],
                error: Some(e.to_string()),
            },
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn print_report_plain(report: &BuildReport) {
    for library in &report.libraries {
        if let Ok(retrieved) = &library.result {
            println!(
                "{}@{} {}",
                retrieved.record.name(),
                retrieved.record.version(),
                retrieved.path.display()
            );
        }
    }
}

fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}
