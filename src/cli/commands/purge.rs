//! Purge command - evict down to the soft limit

use crate::config::Config;
use crate::error::StockpileResult;
use crate::quota::format_bytes;
use crate::replication::LocalContentStore;
use crate::ui::{self, UiContext};

/// Execute the purge command
pub async fn execute(config: &Config) -> StockpileResult<()> {
    let store = LocalContentStore::open(config).await?;
    let grant = store.keeper().purge().await?;
    store.keeper().synchronize().await?;
    let usage = store.keeper().usage();
    let ctx = UiContext::detect();

    if grant.evicted_entries == 0 {
        ui::step_ok_detail(
            &ctx,
            "Nothing to purge",
            &format!("{} used", format_bytes(usage.used_bytes())),
        );
        return Ok(());
    }

    ui::step_ok(
        &ctx,
        &format!(
            "Evicted {} entries ({})",
            grant.evicted_entries,
            format_bytes(grant.evicted_bytes)
        ),
    );
    if usage.used_bytes() > usage.limits.soft_limit_bytes() {
        ui::step_warn_hint(
            &ctx,
            &format!("Still above the soft limit ({} used)", format_bytes(usage.used_bytes())),
            "Remaining content is pinned",
        );
    } else {
        ui::remark(&ctx, &format!("{} used", format_bytes(usage.used_bytes())));
    }

    Ok(())
}
