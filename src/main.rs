//! Stockpile - content-addressable build cache
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use stockpile::cli::{Cli, Commands};
use stockpile::config::ConfigManager;
use stockpile::error::StockpileResult;
use tracing::debug;
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

async fn run() -> StockpileResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    init_logging(cli.verbose, &config.general.log_format);
    debug!("Using config {}", config_manager.path().display());

    match cli.command {
        Commands::Put(args) => stockpile::cli::commands::put(args, &config).await,
        Commands::List(args) => stockpile::cli::commands::list(args, &config).await,
        Commands::Status(args) => stockpile::cli::commands::status(args, &config).await,
        Commands::Purge => stockpile::cli::commands::purge(&config).await,
        Commands::Calibrate(args) => {
            stockpile::cli::commands::calibrate(args, &config_manager, &config).await
        }
        Commands::Delete(args) => stockpile::cli::commands::delete(args, &config).await,
        Commands::Config(args) => {
            stockpile::cli::commands::config(args, &config_manager, &config).await
        }
    }
}

/// 0 = warn, 1 = info, 2+ = debug; logs go to stderr
fn init_logging(verbose: u8, log_format: &str) {
    let filter = match verbose {
        0 => EnvFilter::new("stockpile=warn"),
        1 => EnvFilter::new("stockpile=info"),
        _ => EnvFilter::new("stockpile=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}
