use crate::aggregator::{max_loss_streak, TradeTally};
use crate::cache::PreparedPicks;
use crate::error::EngineError;
use crate::models::{
    AggregateStats, ExitRuleSet, KellyRecommendation, SimulatedTrade, DISABLED_RULE_THRESHOLD,
};
use crate::simulator::simulate;
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

const TALLY_CHUNK_SIZE: usize = 64;

/// Outcome of replaying every prepared pick under one rule set.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetReport {
    pub rules: ExitRuleSet,
    pub trades: Vec<SimulatedTrade>,
    pub stats: AggregateStats,
    pub kelly: KellyRecommendation,
    pub max_loss_streak: u32,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HorizonReport {
    pub horizon_days: u32,
    pub stats: AggregateStats,
    pub kelly: KellyRecommendation,
}

pub fn run_rule_set(
    prepared: &PreparedPicks,
    rules: &ExitRuleSet,
) -> Result<RuleSetReport, EngineError> {
    rules.validate()?;

    let outcomes: Vec<Option<SimulatedTrade>> = prepared
        .picks
        .par_iter()
        .map(|prepared_pick| {
            match simulate(&prepared_pick.pick, &prepared_pick.window, rules) {
                Ok(trade) => Some(trade),
                Err(err) => {
                    debug!("Skipping {}: {}", prepared_pick.pick.ticker, err);
                    None
                }
            }
        })
        .collect();

    let skipped = outcomes.iter().filter(|outcome| outcome.is_none()).count();
    let trades: Vec<SimulatedTrade> = outcomes.into_iter().flatten().collect();
    Ok(report_from_trades(*rules, trades, skipped))
}

/// Splits the prepared picks by algorithm and reports each group separately.
pub fn run_by_algorithm(
    prepared: &PreparedPicks,
    rules: &ExitRuleSet,
) -> Result<BTreeMap<String, RuleSetReport>, EngineError> {
    let combined = run_rule_set(prepared, rules)?;

    let mut grouped: BTreeMap<String, Vec<SimulatedTrade>> = BTreeMap::new();
    for trade in combined.trades {
        grouped
            .entry(trade.algorithm.clone())
            .or_default()
            .push(trade);
    }

    let reports: BTreeMap<String, RuleSetReport> = grouped
        .into_iter()
        .map(|(algorithm, trades)| (algorithm, report_from_trades(*rules, trades, 0)))
        .collect();

    for (algorithm, report) in &reports {
        info!(
            "{}: {} trades, win rate {:.1}%, avg return {:.2}%, recommended Kelly {:.1}%{}",
            algorithm,
            report.stats.trade_count,
            report.stats.win_rate_pct,
            report.stats.avg_return_pct,
            report.kelly.recommended * 100.0,
            if report.kelly.has_edge() { "" } else { " (no edge)" }
        );
    }
    Ok(reports)
}

/// Fixed-horizon backtests: take-profit and stop-loss are disabled and every
/// trade exits at the close `horizon` bars after entry, or at the last bar.
pub fn run_horizons(
    prepared: &PreparedPicks,
    horizons: &[u32],
) -> Result<Vec<HorizonReport>, EngineError> {
    if horizons.is_empty() {
        return Err(EngineError::InvalidInput(
            "at least one horizon is required".to_string(),
        ));
    }

    horizons
        .iter()
        .map(|&horizon_days| {
            let rules =
                ExitRuleSet::new(DISABLED_RULE_THRESHOLD, DISABLED_RULE_THRESHOLD, horizon_days);
            let report = run_rule_set(prepared, &rules)?;
            Ok(HorizonReport {
                horizon_days,
                stats: report.stats,
                kelly: report.kelly,
            })
        })
        .collect()
}

// Chunk boundaries are fixed and partials merge in order, so float sums are reproducible.
fn report_from_trades(
    rules: ExitRuleSet,
    trades: Vec<SimulatedTrade>,
    skipped: usize,
) -> RuleSetReport {
    let partials: Vec<TradeTally> = trades
        .par_chunks(TALLY_CHUNK_SIZE)
        .map(|chunk| {
            let mut partial = TradeTally::new();
            chunk.iter().for_each(|trade| partial.push(trade));
            partial
        })
        .collect();
    let stats = partials
        .into_iter()
        .fold(TradeTally::new(), TradeTally::merge)
        .finish();

    RuleSetReport {
        rules,
        kelly: KellyRecommendation::from_stats(&stats),
        max_loss_streak: max_loss_streak(&trades),
        stats,
        trades,
        skipped,
    }
}
