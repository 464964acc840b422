//! Delete command - remove content by hash

use crate::cli::args::DeleteArgs;
use crate::config::Config;
use crate::context::OperationContext;
use crate::error::{StockpileError, StockpileResult};
use crate::quota::format_bytes;
use crate::replication::{DeleteFileHandler, DeleteOptions, DeleteStatus, LocalContentStore};
use crate::ui::{self, UiContext};

/// Execute the delete command
pub async fn execute(args: DeleteArgs, config: &Config) -> StockpileResult<()> {
    let store = LocalContentStore::open(config).await?;
    let ctx = OperationContext::new().with_label("delete");
    let options = DeleteOptions {
        fan_out: args.fan_out,
    };

    let result = store.handle_delete(&ctx, args.hash, options).await;
    let ui_ctx = UiContext::detect();

    match result.status() {
        DeleteStatus::Deleted => ui::step_ok_detail(
            &ui_ctx,
            &format!("Deleted {}", args.hash.short()),
            &format_bytes(result.freed_bytes()),
        ),
        DeleteStatus::Absent => {
            ui::step_ok_detail(&ui_ctx, &format!("Deleted {}", args.hash.short()), "not present")
        }
        DeleteStatus::Failed => {
            return Err(StockpileError::User(
                result.error_message().unwrap_or("delete failed").to_string(),
            ));
        }
    }

    if let Some(report) = result.diagnostics() {
        ui::remark(&ui_ctx, report);
    }

    Ok(())
}
