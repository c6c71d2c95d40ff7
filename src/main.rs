use anyhow::{bail, Context};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use rusty_archive_access::archiver::{ArchiveAccess, ArchiveConfig, RetrievalMode};
use rusty_archive_access::constants::DEFAULT_BASE_URL;
use rusty_archive_access::{export, logging};

#[derive(Parser, Debug)]
#[command(name = "archive-query", version, about = "Query EPICS archivers")]
struct Cli {
    /// JSON configuration file; `QE_ARCHIVE_*` variables are used otherwise.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh the index and show each archiver's state.
    Status,
    /// List PV names matching a regular expression.
    Search { pattern: String },
    /// Fetch one PV over the last N hours.
    Fetch {
        pv: String,
        #[arg(long, default_value_t = 1.0)]
        hours: f64,
        /// Request server-side mean bins of this many seconds.
        #[arg(long)]
        bin: Option<u32>,
        #[arg(long)]
        csv: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&cli.log_level, cli.json_logs)?;

    let mut config = match &cli.config {
        Some(path) => ArchiveConfig::from_json_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ArchiveConfig::from_env()?,
    };
    if config.archivers.is_empty() {
        info!(url = DEFAULT_BASE_URL, "no archivers configured, using default");
        config = config.with_archiver("default", DEFAULT_BASE_URL);
    }

    let access = ArchiveAccess::connect(config)?;

    match cli.command {
        Commands::Status => {
            let summary = access.refresh_index().await?;
            println!("{}", serde_json::to_string_pretty(&access.archiver_status())?);
            if !summary.is_complete() {
                eprintln!("{} archiver(s) unreachable", summary.failed().len());
            }
        }
        Commands::Search { pattern } => {
            for name in access.matching_pv_names(&pattern).await? {
                println!("{}", name);
            }
        }
        Commands::Fetch { pv, hours, bin, csv } => {
            if hours.is_nan() || hours <= 0.0 {
                bail!("--hours must be positive");
            }
            let end = Utc::now();
            let start = end - ChronoDuration::milliseconds((hours * 3_600_000.0) as i64);
            let mode = bin.map(RetrievalMode::Mean).unwrap_or(RetrievalMode::Raw);

            let result = access.get_data_with(&pv, start, end, mode).await?;
            for diagnostic in &result.diagnostics {
                eprintln!("warning: {}", serde_json::to_string(diagnostic)?);
            }
            let output = if csv {
                export::to_csv(&result.pv, &result.sequence)?
            } else {
                export::to_text(&result.pv, &result.sequence)?
            };
            print!("{}", output);
        }
    }

    access.shutdown();
    Ok(())
}
