//! # llmdocs CLI
//!
//! The `llmdocs` binary drives the pipeline: it stands in for the scheduler
//! (`refresh`, `distill`) and for readers (`materialize`, `distilled`, `get`,
//! `search`).
//!
//! ## Usage
//!
//! ```bash
//! llmdocs --config ./config/llmdocs.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `llmdocs init` | Create the SQLite database and run schema migrations |
//! | `llmdocs sources` | List configured sources with document counts and staleness |
//! | `llmdocs presets` | List configured presets |
//! | `llmdocs sync [owner/repo]` | Reconcile one or all sources |
//! | `llmdocs refresh` | Reconcile stale sources, then materialize non-distilled presets |
//! | `llmdocs materialize <preset>` | Print (or write) a preset bundle |
//! | `llmdocs distill <preset>` | Run a distillation job |
//! | `llmdocs distilled <group>` | Print a distilled artifact |
//! | `llmdocs versions <group>` | List a grouping's distilled versions |
//! | `llmdocs jobs` | List recent distillation jobs |
//! | `llmdocs get <owner/repo> <path>` | Print one stored document |
//! | `llmdocs search "<query>"` | Best title/path match |
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); command output goes to
//! stdout.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llmdocs::config::{load_config, Config};
use llmdocs::pipeline::{Pipeline, SourceSync, SyncOutcome};
use llmdocs::store::SqliteStore;

/// llmdocs: documentation ingestion, preset bundles and distillation.
#[derive(Parser)]
#[command(
    name = "llmdocs",
    about = "Ingest documentation from GitHub, materialize preset bundles, and distill them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/llmdocs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List configured presets.
    Presets,

    #[command(flatten)]
    Pipeline(PipelineCommand),
}

/// Commands that run against an opened [`Pipeline`].
#[derive(Subcommand)]
enum PipelineCommand {
    /// List configured sources, their document counts and staleness.
    Sources,

    /// Reconcile sources against GitHub.
    ///
    /// Without an argument every configured source is considered. Fresh
    /// sources are skipped unless `--force` is given.
    Sync {
        /// `owner/repo` of a configured source.
        source: Option<String>,

        /// Reconcile even if the source is not stale.
        #[arg(long)]
        force: bool,
    },

    /// Reconcile stale sources, then materialize every non-distilled preset.
    Refresh,

    /// Print a preset's materialized bundle.
    Materialize {
        preset: String,

        /// Write to this file instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Run distillation for a `distill = true` preset.
    Distill { preset: String },

    /// Print a distilled artifact.
    Distilled {
        group: String,

        /// `latest` or a date (`YYYY-MM-DD`).
        #[arg(long, default_value = "latest")]
        version: String,
    },

    /// List the distilled versions of a grouping.
    Versions { group: String },

    /// List recent distillation jobs.
    Jobs {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Print one stored document.
    Get {
        /// `owner/repo`
        source: String,
        path: String,
    },

    /// Find the best-matching document by title, then path.
    Search { query: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
        .ok();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let store = SqliteStore::open(&cfg.db.path).await?;
            store.close().await;
            println!("Database initialized successfully.");
        }
        Commands::Presets => list_presets(&cfg),
        Commands::Pipeline(command) => {
            let pipeline = Pipeline::from_config(cfg).await?;
            let result = run(&pipeline, command).await;
            pipeline.store().close().await;
            result?;
        }
    }

    Ok(())
}

async fn run(pipeline: &Pipeline, command: PipelineCommand) -> Result<()> {
    let now = Utc::now();

    match command {
        PipelineCommand::Sources => {
            let sources = pipeline.sources(now).await?;
            println!("{:<40} {:>6} {:<20} STALE", "SOURCE", "DOCS", "LAST SYNC");
            for s in sources {
                let last = s
                    .last_synced
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{:<40} {:>6} {:<20} {}",
                    s.source.to_string(),
                    s.documents,
                    last,
                    s.stale
                );
            }
        }
        PipelineCommand::Sync { source, force } => {
            let syncs = match source {
                Some(key) => vec![pipeline.sync(&key, force, now).await?],
                None => {
                    let mut out = Vec::new();
                    for source in &pipeline.config().sources {
                        out.push(pipeline.sync_source(source, force, now).await);
                    }
                    out
                }
            };
            let failed = print_syncs(&syncs);
            if failed > 0 {
                bail!("{} source(s) failed to sync", failed);
            }
        }
        PipelineCommand::Refresh => {
            let report = pipeline.refresh(now).await;
            print_syncs(&report.sources);
            for p in &report.presets {
                match &p.result {
                    Ok(summary) => println!(
                        "preset {:<24} {:>5} docs {:>9} bytes",
                        p.preset, summary.documents, summary.bytes
                    ),
                    Err(e) => println!("preset {:<24} FAILED: {}", p.preset, e),
                }
            }
            if report.has_failures() {
                bail!("refresh finished with failures");
            }
        }
        PipelineCommand::Materialize { preset, output } => {
            let text = pipeline.get_materialized(&preset).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &text)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Wrote {} bytes to {}", text.len(), path.display());
                }
                None => print!("{}", text),
            }
        }
        PipelineCommand::Distill { preset } => {
            let job = pipeline.distill(&preset, now).await?;
            println!(
                "job {} {}: {}/{} documents distilled ({} processed), {} input / {} output tokens",
                job.id,
                job.status,
                job.successful_files,
                job.total_files,
                job.processed_files,
                job.total_input_tokens,
                job.total_output_tokens
            );
        }
        PipelineCommand::Distilled { group, version } => {
            match pipeline.get_distilled(&group, &version).await? {
                Some(artifact) => print!("{}", artifact.content),
                None => bail!("no distilled artifact '{}' at version '{}'", group, version),
            }
        }
        PipelineCommand::Versions { group } => {
            let versions = pipeline.list_distilled_versions(&group).await?;
            if versions.is_empty() {
                println!("No distilled versions for '{}'.", group);
            }
            for v in versions {
                println!(
                    "{:<12} {:>8.2} KB {:>5} docs  job {}  {}",
                    v.version,
                    v.size_kb,
                    v.document_count,
                    v.source_job_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    format_ts(v.created_at)
                );
            }
        }
        PipelineCommand::Jobs { limit } => {
            let jobs = pipeline.jobs(limit).await?;
            println!(
                "{:>5} {:<20} {:<10} {:>11} {:>10} {:>10}  STARTED",
                "ID", "PRESET", "STATUS", "OK/TOTAL", "IN TOK", "OUT TOK"
            );
            for job in jobs {
                println!(
                    "{:>5} {:<20} {:<10} {:>11} {:>10} {:>10}  {}",
                    job.id,
                    job.preset,
                    job.status.as_str(),
                    format!("{}/{}", job.successful_files, job.total_files),
                    job.total_input_tokens,
                    job.total_output_tokens,
                    format_ts(job.started_at)
                );
                if let Some(err) = job.error_message {
                    println!("      error: {}", err);
                }
            }
        }
        PipelineCommand::Get { source, path } => {
            match pipeline.get_document(&source, &path).await? {
                Some(doc) => {
                    println!("--- {}:{} ---", doc.source, doc.path);
                    println!("title: {}", doc.title);
                    println!("size: {} bytes", doc.size);
                    println!("hash: {}", doc.content_hash);
                    println!("synced: {}", format_ts(doc.last_synced_at));
                    println!("---");
                    print!("{}", doc.content);
                }
                None => bail!("document not found: {}:{}", source, path),
            }
        }
        PipelineCommand::Search { query } => match pipeline.search(&query).await? {
            Some(doc) => println!("{}  {}  ({})", doc.source, doc.path, doc.title),
            None => println!("No results."),
        },
    }

    Ok(())
}

fn list_presets(cfg: &Config) {
    println!("{:<24} {:<32} {:>6} DISTILL", "PRESET", "SOURCE", "GROUPS");
    for (key, preset) in &cfg.presets {
        println!(
            "{:<24} {:<32} {:>6} {}",
            key,
            preset.source,
            preset.include.len(),
            preset.distill
        );
    }
}

/// Print one line per source; returns how many failed.
fn print_syncs(syncs: &[SourceSync]) -> usize {
    let mut failed = 0;
    for sync in syncs {
        match &sync.outcome {
            SyncOutcome::Fresh => println!("{:<40} fresh, skipped", sync.source),
            SyncOutcome::Reconciled(counts) => println!("{:<40} {}", sync.source, counts),
            SyncOutcome::Failed(e) => {
                failed += 1;
                println!("{:<40} FAILED: {}", sync.source, e);
            }
        }
    }
    failed
}

fn format_ts(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
