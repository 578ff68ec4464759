use crate::backtest::{run_by_algorithm, run_rule_set};
use crate::commands::{load_engine_context, result_label};
use crate::context::AppContext;
use crate::models::ExitRuleSet;
use crate::retry::retry_db_operation;
use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use std::path::PathBuf;

pub struct SimulateArgs {
    pub take_profit: f64,
    pub stop_loss: f64,
    pub max_hold: u32,
    pub algorithm: Option<String>,
    pub data_file: Option<PathBuf>,
    pub persist: bool,
}

pub async fn run(app: &AppContext, args: SimulateArgs) -> Result<()> {
    let context =
        load_engine_context(app, args.data_file.as_deref(), args.algorithm.clone()).await?;
    let grid = &context.settings().grid;
    let rules = ExitRuleSet::new(args.take_profit, args.stop_loss, args.max_hold)
        .with_costs(grid.slippage_pct, grid.commission);
    rules.validate().context("Invalid exit rules")?;
    info!("Simulating picks with {}", rules.label());

    let prepared = context.prepare_picks(rules.hold_limit())?;
    let overall = run_rule_set(&prepared, &rules)?;
    info!(
        "{}: {} trades, win rate {:.1}%, avg return {:.2}%, best {:.2}%, worst {:.2}%, pnl {:.2}, longest losing run {}",
        result_label(args.algorithm.as_deref()),
        overall.stats.trade_count,
        overall.stats.win_rate_pct,
        overall.stats.avg_return_pct,
        overall.stats.best_pct,
        overall.stats.worst_pct,
        overall.stats.total_pnl,
        overall.max_loss_streak
    );
    info!(
        "Kelly: full {:.2}%, half {:.2}%, quarter {:.2}%, recommended {:.2}% (edge {:.4}, payoff {:.2})",
        overall.kelly.full * 100.0,
        overall.kelly.half * 100.0,
        overall.kelly.quarter * 100.0,
        overall.kelly.recommended * 100.0,
        overall.kelly.edge,
        overall.kelly.payoff_ratio
    );

    if !overall.kelly.has_edge() {
        warn!("{} shows no positive edge; Kelly recommends no position", rules.label());
    }

    let by_algorithm = run_by_algorithm(&prepared, &rules)?;

    if !args.persist {
        return Ok(());
    }
    let Some(db) = context.database() else {
        warn!("--persist requested but no database is configured; Kelly data not stored");
        return Ok(());
    };
    let run_date = Utc::now().date_naive();
    for (algorithm, report) in &by_algorithm {
        let persist_context = format!("storing Kelly recommendation for {}", algorithm);
        retry_db_operation!(persist_context, async {
            db.upsert_kelly_recommendation(
                algorithm,
                run_date,
                &report.kelly,
                report.stats.trade_count,
            )
            .await
        })?;
    }
    info!(
        "Stored Kelly recommendations for {} algorithm(s) on {}",
        by_algorithm.len(),
        run_date
    );
    Ok(())
}
