//! CLI argument definitions using clap derive

use crate::hash::ContentHash;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Stockpile - content-addressable build cache
///
/// Stores build artifacts by SHA-256 hash under a disk quota and replicates
/// fresh content to peer machines.
#[derive(Parser, Debug)]
#[command(name = "stockpile")]
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
    #[arg(short, long, global = true, env = "STOCKPILE_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Store a file and print its hash
    Put(PutArgs),

    /// List stored content
    List(ListArgs),

    /// Show quota usage and limits
    Status(StatusArgs),

    /// Evict content until usage is at or below the soft limit
    Purge,

    /// Validate and apply new quota limits
    Calibrate(CalibrateArgs),

    /// Delete content by hash
    Delete(DeleteArgs),

    /// Show or initialize configuration
    Config(ConfigArgs),
}

/// Arguments for the put command
#[derive(Parser, Debug)]
pub struct PutArgs {
    /// File to store
    pub file: PathBuf,

    /// Push the content to peers after storing it
    #[arg(long)]
    pub replicate: bool,
}

/// Arguments for the list command
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, default_value = "table")]
    pub format: OutputFormat,
}

/// Arguments for the calibrate command
#[derive(Parser, Debug)]
pub struct CalibrateArgs {
    /// New hard limit in megabytes
    #[arg(long)]
    pub hard_mb: u64,

    /// Soft limit as a percentage of the hard limit
    #[arg(long, default_value = "90", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub soft_percent: u8,

    /// Write the new limits to the configuration file
    #[arg(long)]
    pub save: bool,
}

/// Arguments for the delete command
#[derive(Parser, Debug)]
pub struct DeleteArgs {
    /// Content hash (64 hex characters)
    #[arg(value_parser = parse_hash)]
    pub hash: ContentHash,

    /// Also delete from every other machine known to hold the content
    #[arg(long)]
    pub fan_out: bool,
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
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

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}

/// Output format for list and status
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

fn parse_hash(s: &str) -> Result<ContentHash, String> {
    s.parse::<ContentHash>().map_err(|e| e.to_string())
}
