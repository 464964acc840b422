//! List command - show stored content

use crate::cli::args::{ListArgs, OutputFormat};
use crate::config::Config;
use crate::error::StockpileResult;
use crate::index::{ContentEntry, ContentIndex};
use crate::quota::format_bytes;
use crate::storage::{ContentStorage, FileSystemStorage};
use crate::ui::{self, UiContext};
use console::style;

/// Execute the list command
///
/// Reads the store directly; no keeper is started.
pub async fn execute(args: ListArgs, config: &Config) -> StockpileResult<()> {
    let storage = FileSystemStorage::open(&config.store.root).await?;
    let index = ContentIndex::from_existing(
        storage
            .list()
            .await?
            .into_iter()
            .map(|c| (c.hash, c.size_bytes, c.modified)),
    );
    let entries = index.snapshot().entries().to_vec();

    if entries.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => ui::step_info(&UiContext::detect(), "Store is empty"),
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Plain => print_plain(&entries),
    }

    Ok(())
}

fn print_table(entries: &[ContentEntry]) {
    println!(
        "{:<66} {:>10} {:<20}",
        style("HASH").bold(),
        style("SIZE").bold(),
        style("LAST ACCESS").bold()
    );
    println!("{}", "-".repeat(98));

    for entry in entries {
        println!(
            "{:<66} {:>10} {:<20}",
            entry.hash,
            format_bytes(entry.size_bytes),
            entry.last_access.format("%Y-%m-%d %H:%M")
        );
    }

    let total: u64 = entries.iter().map(|e| e.size_bytes).sum();
    println!();
    println!("{} entries, {}", entries.len(), format_bytes(total));
}

fn print_json(entries: &[ContentEntry]) -> StockpileResult<()> {
    let json = serde_json::to_string_pretty(entries)?;
    println!("{}", json);
    Ok(())
}

fn print_plain(entries: &[ContentEntry]) {
    for entry in entries {
        println!("{}", entry.hash);
    }
}
