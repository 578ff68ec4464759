use crate::commands::{load_engine_context, result_label};
use crate::config::MAX_RESULT_LIMIT;
use crate::context::AppContext;
use crate::models::{OptimizationResult, RankedCell};
use crate::optimizer::OptimizerOptions;
use crate::retry::retry_db_operation;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use std::path::PathBuf;
use std::time::Duration;

pub struct OptimizeArgs {
    pub algorithm: Option<String>,
    pub data_file: Option<PathBuf>,
    pub top: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub threads: Option<usize>,
    pub persist: bool,
}

pub async fn run(app: &AppContext, args: OptimizeArgs) -> Result<()> {
    let label = result_label(args.algorithm.as_deref());
    info!("Received optimize command for algorithm={}", label);

    let context =
        load_engine_context(app, args.data_file.as_deref(), args.algorithm.clone()).await?;
    let settings = context.settings().clone();

    let mut options = OptimizerOptions::from_settings(&settings);
    if let Some(timeout_secs) = args.timeout_secs {
        options.timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));
    }
    options.worker_threads = args.threads;
    options.show_progress = true;

    let limit = args
        .top
        .unwrap_or(settings.result_limit)
        .clamp(1, MAX_RESULT_LIMIT);
    info!(
        "Grid: {} take-profit x {} stop-loss x {} max-hold = {} cells; objective: maximize {}",
        settings.grid.take_profit_pcts.len(),
        settings.grid.stop_loss_pcts.len(),
        settings.grid.max_hold_days.len(),
        settings.grid.total_cells(),
        options.objective.label()
    );

    let prepared = context.prepare_picks(settings.grid.longest_hold())?;
    let result = context
        .optimizer()
        .optimize(&settings.grid, prepared, &options)
        .context("Grid optimization failed")?;

    log_result(&result, limit);

    if !args.persist {
        return Ok(());
    }
    let Some(db) = context.database() else {
        warn!("--persist requested but no database is configured; result not stored");
        return Ok(());
    };
    let run_date = Utc::now().date_naive();
    let persist_context = format!("storing optimization result for {}", label);
    retry_db_operation!(persist_context, async {
        db.upsert_optimization_result(&label, run_date, &result)
            .await
    })?;
    info!(
        "Stored optimization result {} for {} on {}",
        result.run_id, label, run_date
    );
    Ok(())
}

fn log_result(result: &OptimizationResult, limit: usize) {
    info!(
        "Tested {}/{} cells over {} picks; {} produced trades, {:.1}% profitable{}",
        result.combos_tested,
        result.combos_total,
        result.picks_evaluated,
        result.ranked.len(),
        result.profitability_rate,
        if result.timed_out {
            " (timed out, partial result)"
        } else {
            ""
        }
    );

    if result.picks_unavailable > 0 {
        warn!(
            "Partial result: price data was unavailable for {} pick(s)",
            result.picks_unavailable
        );
    }
    if result.picks_skipped > 0 {
        info!(
            "{} pick(s) skipped for insufficient data or invalid prices",
            result.picks_skipped
        );
    }

    info!("Top {} by {}:", limit.min(result.ranked.len()), result.objective);
    for (rank, cell) in result.top(limit).iter().enumerate() {
        log_cell(rank + 1, cell);
    }
    info!(
        "Bottom {} by {}:",
        limit.min(result.ranked.len()),
        result.objective
    );
    for (rank, cell) in result.bottom(limit).into_iter().enumerate() {
        log_cell(result.ranked.len() - rank, cell);
    }
}

fn log_cell(rank: usize, cell: &RankedCell) {
    info!(
        "#{:>3} [{}] score {:.4}: {} trades, win {:.1}%, avg {:.2}% (win {:.2}% / loss {:.2}%)",
        rank,
        cell.rules.label(),
        cell.score,
        cell.stats.trade_count,
        cell.stats.win_rate_pct,
        cell.stats.avg_return_pct,
        cell.stats.avg_win_pct,
        cell.stats.avg_loss_pct
    );
}
