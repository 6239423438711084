use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use fretlog::catalog::{Catalog, RecordFilter};
use fretlog::config::Config;
use fretlog::export::{export_records, ExportFormat};
use fretlog::logging;
use fretlog::model::Label;
use fretlog::pipeline::{build_sources, Pipeline};

#[derive(Parser, Debug)]
#[command(name = "fretlog", version, about = "Guitar image ingestion and cataloging")]
struct Cli {
    /// Path to config file (defaults to $XDG_CONFIG_HOME/fretlog/config.toml)
    #[arg(short, long, global = true, env = "FRETLOG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one ingestion pass over the configured providers
    Run {
        /// Only search these providers (repeatable)
        #[arg(long = "provider")]
        providers: Vec<String>,
        /// Replace the configured search queries (repeatable)
        #[arg(long = "query")]
        queries: Vec<String>,
        /// Cap on candidates taken from each query
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Write catalog records to a CSV or JSON file
    Export {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value = "csv")]
        format: ExportFormat,
        #[arg(long)]
        label: Option<Label>,
        #[arg(long)]
        provider: Option<String>,
        /// Only records ingested at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only records ingested before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
    /// Show record counts and recent runs
    Stats,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let _ = logging::init(Some(config.data_dir.join("logs")));

    let result = match cli.command {
        Commands::Run {
            providers,
            queries,
            max_results,
        } => run_ingestion(config, providers, queries, max_results).await,
        Commands::Export {
            output,
            format,
            label,
            provider,
            since,
            until,
        } => {
            let mut filter = RecordFilter::default();
            if let Some(label) = label {
                filter = filter.label(label);
            }
            if let Some(provider) = provider {
                filter = filter.provider(provider);
            }
            if let Some(since) = since {
                filter = filter.since(since);
            }
            if let Some(until) = until {
                filter = filter.until(until);
            }
            export(&config, filter, output, format)
        }
        Commands::Stats => stats(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_ingestion(
    mut config: Config,
    providers: Vec<String>,
    queries: Vec<String>,
    max_results: Option<usize>,
) -> Result<()> {
    if let Some(max) = max_results {
        config.pipeline.max_results_per_query = max;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight work");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let summary = tokio::task::spawn_blocking(move || -> Result<_> {
        let pipeline = Pipeline::open(config)?;
        let sources = build_sources(pipeline.config(), pipeline.transport(), &providers, &queries)?;
        Ok(pipeline.run(sources, cancel)?)
    })
    .await??;

    println!("{}", summary);
    Ok(())
}

fn export(config: &Config, filter: RecordFilter, output: PathBuf, format: ExportFormat) -> Result<()> {
    let catalog = Catalog::open(&config.db_path)?;
    let count = export_records(&catalog, filter, &output, format)?;
    info!("Exported {} records as {} to {:?}", count, format.name(), output);
    println!("{} records written to {}", count, output.display());
    Ok(())
}

fn stats(config: &Config) -> Result<()> {
    let catalog = Catalog::open(&config.db_path)?;

    let total = catalog.count(&RecordFilter::default())?;
    println!("{} records in {}", total, config.db_path.display());
    for (provider, label, count) in catalog.counts_by_provider_and_label()? {
        println!("  {:<10} {:<9} {:>8}", provider, label.as_str(), count);
    }

    let runs = catalog.recent_runs(5)?;
    if !runs.is_empty() {
        println!("\nRecent runs:");
        for run in runs {
            println!(
                "  {} [{}] {}",
                run.summary.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.state,
                run.summary
            );
            if let Some(message) = run.error_message {
                println!("      {}", message);
            }
        }
    }
    Ok(())
}
