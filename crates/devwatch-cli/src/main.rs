use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use devwatch_storage::ProjectStore;
use devwatch_sync::{status_report, CollectionOrchestrator, SourceRegistry, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "devwatch")]
#[command(about = "Collect civic development projects into one SQLite dataset")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, normalize and upsert every enabled source, or one named source.
    Collect {
        #[arg(long)]
        source: Option<String>,
    },
    /// Print project counts and the latest run per source.
    Status {
        /// Emit a markdown summary instead of plain text.
        #[arg(long, conflicts_with = "commit_message")]
        markdown: bool,
        /// Emit a one-line summary for an automated data commit.
        #[arg(long)]
        commit_message: bool,
    },
    /// Create the database schema if it does not exist.
    Migrate,
    /// Serve the read-only dashboard.
    Serve,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "devwatch=debug" } else { "devwatch=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(config: &SyncConfig) -> Result<ProjectStore> {
    ProjectStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening {}", config.database_url))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = SyncConfig::from_env();
    match cli.command.unwrap_or(Commands::Collect { source: None }) {
        Commands::Collect { source } => {
            let store = open_store(&config).await?;
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            let orchestrator = CollectionOrchestrator::new(&config, store, registry)?;
            let report = orchestrator.collect(source.as_deref()).await?;

            for run in &report.runs {
                println!(
                    "{:<18} {:<16} seen={} written={} (new={} updated={}) excluded={} failed={}{}",
                    run.source,
                    run.status.as_str(),
                    run.tally.records_seen,
                    run.tally.records_written,
                    run.tally.records_inserted,
                    run.tally.records_updated,
                    run.tally.records_excluded,
                    run.tally.record_failures(),
                    run.error_message
                        .as_deref()
                        .map(|e| format!(" error: {e}"))
                        .unwrap_or_default(),
                );
            }
            for name in &report.unknown_sources {
                eprintln!(
                    "unknown source {name:?}; known sources: {}",
                    orchestrator
                        .registry()
                        .sources
                        .iter()
                        .map(|s| s.source_id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            for failure in &report.failed_sources {
                eprintln!("{}: {}", failure.source_id, failure.message);
            }
            if report.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Status {
            markdown,
            commit_message,
        } => {
            let store = open_store(&config).await?;
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            let report = status_report(&store, &registry).await?;
            if markdown {
                println!("{}", report.to_markdown());
            } else if commit_message {
                println!("{}", report.to_commit_message());
            } else {
                print!("{}", report.to_text());
            }
        }
        Commands::Migrate => {
            let store = open_store(&config).await?;
            store.migrate().await.context("running migrations")?;
            info!(database_url = %config.database_url, "schema ready");
            println!("schema ready: {}", config.database_url);
        }
        Commands::Serve => {
            devwatch_web::serve(&config).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
