use crate::backtest::run_horizons;
use crate::commands::{load_engine_context, result_label};
use crate::context::AppContext;
use anyhow::{anyhow, Result};
use log::info;
use std::path::PathBuf;

pub const DEFAULT_HORIZONS: [u32; 4] = [1, 5, 10, 20];

pub async fn run(
    app: &AppContext,
    algorithm: Option<String>,
    data_file: Option<PathBuf>,
    days: Vec<u32>,
) -> Result<()> {
    let mut horizons = if days.is_empty() {
        DEFAULT_HORIZONS.to_vec()
    } else {
        days
    };
    horizons.sort_unstable();
    horizons.dedup();
    if horizons.first() == Some(&0) {
        return Err(anyhow!("Horizons must be at least one day"));
    }

    let context = load_engine_context(app, data_file.as_deref(), algorithm.clone()).await?;
    let prepared = context.prepare_picks(horizons.last().copied())?;
    let reports = run_horizons(&prepared, &horizons)?;

    info!(
        "Fixed-horizon results for {} ({} picks):",
        result_label(algorithm.as_deref()),
        prepared.len()
    );
    for report in reports {
        info!(
            "{:>3}d: {} trades, win rate {:.1}%, avg return {:.2}%, avg win {:.2}%, avg loss {:.2}%, recommended Kelly {:.1}%",
            report.horizon_days,
            report.stats.trade_count,
            report.stats.win_rate_pct,
            report.stats.avg_return_pct,
            report.stats.avg_win_pct,
            report.stats.avg_loss_pct,
            report.kelly.recommended * 100.0
        );
    }
    Ok(())
}
