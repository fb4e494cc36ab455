//! datawell - snapshot persistence CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use datawell_app::{AppConfig, Application};
use datawell_core::ActionStatus;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Persist and query per-symbol market snapshots.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via DATAWELL_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sanitize and store documents from a JSON array or JSON-lines file
    Store {
        file: PathBuf,
    },
    /// Print stored items as JSON
    Find {
        #[arg(long)]
        symbol: Option<String>,
        /// YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,
    },
    /// Delete all items of the given symbols
    Purge {
        symbols: Vec<String>,
        /// Clear the entire table (drops and recreates it)
        #[arg(long)]
        all: bool,
    },
    /// Delete a single item
    Delete {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        date: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Determine config path: CLI arg > DATAWELL_CONFIG env var > default
    let config_path = AppConfig::resolve_path(args.config);
    let config = AppConfig::load(&config_path)?;

    datawell_telemetry::init_logging(&config.telemetry.log_level)?;
    info!("Starting datawell v{}", env!("CARGO_PKG_VERSION"));
    if Path::new(&config_path).exists() {
        info!(config_path = %config_path, "Configuration loaded");
    } else {
        warn!(config_path = %config_path, "Config file not found, using defaults");
    }

    let app = Application::new(config).await?;

    match args.command {
        Command::Store { file } => {
            let status = app.store_file(&file).await?;
            println!("{status}");
            if status == ActionStatus::Error {
                anyhow::bail!("documents were not persisted");
            }
        }
        Command::Find { symbol, date } => {
            let items = app.find(symbol.as_deref(), date.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        Command::Purge { symbols, all } => {
            let deleted = app.purge(&symbols, all).await?;
            if deleted < 0 {
                println!("table cleared");
            } else {
                println!("{deleted} item(s) deleted");
            }
        }
        Command::Delete { symbol, date } => {
            app.delete(&symbol, &date).await?;
            println!("deleted {symbol}@{date}");
        }
    }

    Ok(())
}
