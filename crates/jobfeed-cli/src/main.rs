use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use jobfeed_core::{ImportReport, WriteMode};
use jobfeed_decode::PayloadFormat;
use jobfeed_ingest::{BatchSize, ImportError, ImportService, IngestConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobfeed")]
#[command(about = "Bulk job-posting import pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import one NDJSON or CSV file, or an http(s) URL.
    Import {
        source: String,
        /// Overrides detection from the file extension or response content type.
        #[arg(long)]
        format: Option<PayloadFormat>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        insert_only: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Import every enabled feed listed in feeds.yaml.
    Sync,
    /// Print the writable columns of the target table.
    Schema,
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Import {
            source,
            format,
            batch_size,
            insert_only,
            dry_run,
        } => {
            let service = ImportService::connect(IngestConfig::from_env()).await?;
            let mut options = service.config().import_options();
            if let Some(size) = batch_size {
                options.batch_size = BatchSize::clamped(size);
            }
            if insert_only {
                options.mode = WriteMode::InsertOnly;
            }
            options.dry_run |= dry_run;

            let outcome = if source.starts_with("http://") || source.starts_with("https://") {
                let fetcher = service.http_fetcher()?;
                service
                    .import_url(&fetcher, "cli", &source, format, options)
                    .await
            } else {
                service
                    .import_file(&PathBuf::from(&source), format, options)
                    .await
            };

            match outcome {
                Ok(report) => print_report(&report)?,
                Err(ImportError::Aborted(aborted)) => {
                    print_report(&aborted.report)?;
                    bail!("{aborted}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Commands::Sync => {
            let summary = jobfeed_ingest::run_sync_once_from_env().await?;
            info!(run_id = %summary.run_id, feeds = summary.feeds.len(), "sync complete");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schema => {
            let config = IngestConfig::from_env();
            let table = config.target_table.clone();
            let service = ImportService::connect(config).await?;
            match service.schema().await {
                Some(schema) => {
                    for (column, kind) in schema.columns() {
                        println!("{column}\t{kind}");
                    }
                }
                None => println!("no writable columns found for {table}; imports run in pass-through mode"),
            }
        }
        Commands::Serve => {
            jobfeed_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn print_report(report: &ImportReport) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}
