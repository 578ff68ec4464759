use crate::allocator::allocate;
use crate::backtest::run_by_algorithm;
use crate::commands::load_engine_context;
use crate::context::AppContext;
use crate::data_context::PickSource;
use crate::models::{ExitRuleSet, KellyRecommendation};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct AllocateArgs {
    pub capital: f64,
    pub max_positions: Option<usize>,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub max_hold: Option<u32>,
    pub algorithm: Option<String>,
    pub data_file: Option<PathBuf>,
}

pub async fn run(app: &AppContext, args: AllocateArgs) -> Result<()> {
    let context =
        load_engine_context(app, args.data_file.as_deref(), args.algorithm.clone()).await?;
    let settings = context.settings().clone();
    let max_positions = args.max_positions.unwrap_or(settings.max_positions);

    let kelly_by_algorithm: HashMap<String, KellyRecommendation> =
        match (args.take_profit, args.stop_loss, args.max_hold) {
            (Some(take_profit), Some(stop_loss), Some(max_hold)) => {
                let rules = ExitRuleSet::new(take_profit, stop_loss, max_hold)
                    .with_costs(settings.grid.slippage_pct, settings.grid.commission);
                rules.validate().context("Invalid exit rules")?;
                info!("Deriving Kelly fractions from a backtest with {}", rules.label());
                let prepared = context.prepare_picks(rules.hold_limit())?;
                run_by_algorithm(&prepared, &rules)?
                    .into_iter()
                    .map(|(algorithm, report)| (algorithm, report.kelly))
                    .collect()
            }
            (None, None, None) => match context.database() {
                Some(db) => db
                    .get_kelly_recommendations(Utc::now().date_naive())
                    .await
                    .context("Failed to load stored Kelly recommendations")?,
                None => {
                    warn!(
                        "No exit rules given and no database configured; using the default Kelly fraction of {:.0}%",
                        settings.default_kelly_fraction * 100.0
                    );
                    HashMap::new()
                }
            },
            _ => {
                return Err(anyhow!(
                    "--take-profit, --stop-loss and --max-hold must be given together"
                ))
            }
        };

    let picks = context.market_data().picks(context.filter());
    let allocation = allocate(
        args.capital,
        &picks,
        &kelly_by_algorithm,
        max_positions,
        settings.default_kelly_fraction,
    )?;

    for position in &allocation.positions {
        info!(
            "{:<8} {:>6} shares @ {:.2} = {:.2} ({}; score {:.2}, Kelly {:.1}%)",
            position.ticker,
            position.shares,
            position.entry_price,
            position.position_value,
            position.algorithm,
            position.score,
            position.kelly_fraction * 100.0
        );
    }
    for skipped in &allocation.skipped {
        warn!("Skipped {} ({}): {}", skipped.ticker, skipped.algorithm, skipped.reason);
    }
    info!(
        "Allocated {:.2} of {:.2} ({:.1}%) across {} positions; {:.2} cash remaining",
        allocation.total_allocated,
        allocation.capital,
        allocation.allocation_pct,
        allocation.positions.len(),
        allocation.cash_remaining
    );
    Ok(())
}
