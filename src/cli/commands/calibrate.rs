//! Calibrate command - apply new quota limits

use crate::cli::args::CalibrateArgs;
use crate::config::{Config, ConfigManager};
use crate::error::StockpileResult;
use crate::quota::{format_bytes, mb_to_bytes, CalibrationInput};
use crate::replication::LocalContentStore;
use crate::ui::{self, UiContext};

/// Execute the calibrate command
///
/// Limits are validated by the keeper before anything is written. When
/// current usage sits above the new soft limit the store is purged.
pub async fn execute(
    args: CalibrateArgs,
    manager: &ConfigManager,
    config: &Config,
) -> StockpileResult<()> {
    let store = LocalContentStore::open(config).await?;
    let input = CalibrationInput::from_percent(mb_to_bytes(args.hard_mb), args.soft_percent);
    let limits = store.keeper().calibrate(input).await?;
    let ctx = UiContext::detect();

    ui::step_ok_detail(&ctx, "Limits valid", &limits.to_string());

    store.keeper().synchronize().await?;
    if store.keeper().usage().used_bytes() > limits.soft_limit_bytes() {
        let grant = store.keeper().purge().await?;
        ui::step_ok(
            &ctx,
            &format!(
                "Evicted {} entries ({}) to meet the new soft limit",
                grant.evicted_entries,
                format_bytes(grant.evicted_bytes)
            ),
        );
    }

    if args.save {
        let mut updated = config.clone();
        updated.quota.hard_limit_mb = args.hard_mb;
        updated.quota.soft_limit_percent = args.soft_percent;
        manager.save(&updated).await?;
        ui::step_ok_detail(&ctx, "Saved", &manager.path().display().to_string());
    } else {
        ui::remark(&ctx, "Pass --save to keep these limits");
    }

    Ok(())
}
