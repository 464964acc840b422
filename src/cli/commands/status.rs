//! Status command - quota usage and limits

use crate::cli::args::{OutputFormat, StatusArgs};
use crate::config::Config;
use crate::error::StockpileResult;
use crate::quota::{format_bytes, QuotaUsage, SizeStatus};
use crate::replication::LocalContentStore;
use crate::ui::{self, UiContext};
use serde::Serialize;

#[derive(Serialize)]
struct StatusReport<'a> {
    machine: &'a str,
    store: String,
    policy: &'static str,
    used_bytes: u64,
    content_bytes: u64,
    reserved_bytes: u64,
    entry_count: usize,
    soft_limit_bytes: u64,
    hard_limit_bytes: u64,
    percent_of_hard: f64,
    status: SizeStatus,
}

/// Execute the status command
pub async fn execute(args: StatusArgs, config: &Config) -> StockpileResult<()> {
    let store = LocalContentStore::open(config).await?;
    store.keeper().synchronize().await?;
    let usage = store.keeper().usage();

    let report = StatusReport {
        machine: store.machine().as_str(),
        store: config.store.root.display().to_string(),
        policy: store.keeper().policy_name(),
        used_bytes: usage.used_bytes(),
        content_bytes: usage.content_bytes,
        reserved_bytes: usage.reserved_bytes,
        entry_count: usage.entry_count,
        soft_limit_bytes: usage.limits.soft_limit_bytes(),
        hard_limit_bytes: usage.limits.hard_limit_bytes(),
        percent_of_hard: SizeStatus::percentage(
            usage.used_bytes(),
            usage.limits.hard_limit_bytes(),
        ),
        status: usage.status(),
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            let status = match report.status {
                SizeStatus::Ok => "ok",
                SizeStatus::Warning => "warning",
                SizeStatus::Exceeded => "exceeded",
            };
            println!("{} {} {}", status, report.used_bytes, report.hard_limit_bytes);
        }
        OutputFormat::Table => print_table(&report, &usage),
    }

    Ok(())
}

fn print_table(report: &StatusReport<'_>, usage: &QuotaUsage) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Stockpile Status");

    ui::key_value(&ctx, "Machine", report.machine);
    ui::key_value(&ctx, "Store", &report.store);
    ui::key_value(&ctx, "Policy", report.policy);
    ui::key_value(&ctx, "Entries", &report.entry_count.to_string());
    ui::key_value(&ctx, "Reserved", &format_bytes(report.reserved_bytes));
    ui::key_value(&ctx, "Limits", &usage.limits.to_string());
    ui::key_value_status(
        &ctx,
        "Used",
        &format!(
            "{} ({:.1}%)",
            format_bytes(report.used_bytes),
            report.percent_of_hard
        ),
        report.status == SizeStatus::Ok,
    );

    match report.status {
        SizeStatus::Ok => {}
        SizeStatus::Warning => {
            ui::step_warn_hint(&ctx, "Above the soft limit", "Run: stockpile purge")
        }
        SizeStatus::Exceeded => ui::step_error_detail(
            &ctx,
            "Hard limit reached",
            "new content will be rejected until space is freed",
        ),
    }
}
