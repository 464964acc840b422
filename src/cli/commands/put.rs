//! Put command - store a file

use crate::cli::args::PutArgs;
use crate::config::Config;
use crate::context::OperationContext;
use crate::error::{StockpileError, StockpileResult};
use crate::quota::format_bytes;
use crate::replication::{LocalContentStore, PutStatus};
use crate::ui::{self, UiContext};
use tokio_util::sync::CancellationToken;

/// Execute the put command
pub async fn execute(args: PutArgs, config: &Config) -> StockpileResult<()> {
    let store = LocalContentStore::open(config).await?;
    let ctx = OperationContext::new().with_label("put");

    let put = store.put_file(&ctx, &args.file).await?;
    match put.status() {
        PutStatus::Stored | PutStatus::AlreadyPresent => {}
        PutStatus::Rejected(_) | PutStatus::Failed => {
            return Err(StockpileError::User(
                put.error_message().unwrap_or("put failed").to_string(),
            ));
        }
    }

    println!("{}", put.hash());

    let ui_ctx = UiContext::detect();
    let summary = match put.status() {
        PutStatus::AlreadyPresent => "Already stored",
        _ => "Stored",
    };
    ui::step_ok_detail(&ui_ctx, summary, &format_bytes(put.size_bytes()));

    if args.replicate {
        let result = store
            .proactive_copy(&ctx, put.hash(), CancellationToken::new())
            .await;
        if result.succeeded() {
            ui::step_ok(&ui_ctx, &format!("Replication: {}", result));
        } else if let Some(message) = result.error_message() {
            ui::step_warn_hint(&ui_ctx, &message, "Content is stored locally");
        }
    }

    Ok(())
}
