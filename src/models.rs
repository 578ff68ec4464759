use crate::error::EngineError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Rule values at or above this threshold disable the rule entirely.
pub const DISABLED_RULE_THRESHOLD: f64 = 999.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBar {
    pub ticker: String,
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume_shares: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Pick {
    pub ticker: String,
    pub entry_date: DateTime<Utc>,
    pub entry_price: f64,
    pub algorithm: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub shares: Option<i64>,
}

impl Pick {
    pub fn score_or_zero(&self) -> f64 {
        self.score.filter(|s| s.is_finite()).unwrap_or(0.0)
    }

    pub fn share_count(&self) -> i64 {
        self.shares.filter(|s| *s > 0).unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExitRuleSet {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub max_hold_days: u32,
    #[serde(default)]
    pub slippage_pct: Option<f64>,
    #[serde(default)]
    pub commission: Option<f64>,
}

impl ExitRuleSet {
    pub fn new(take_profit_pct: f64, stop_loss_pct: f64, max_hold_days: u32) -> Self {
        Self {
            take_profit_pct,
            stop_loss_pct,
            max_hold_days,
            slippage_pct: None,
            commission: None,
        }
    }

    pub fn with_costs(mut self, slippage_pct: Option<f64>, commission: Option<f64>) -> Self {
        self.slippage_pct = slippage_pct;
        self.commission = commission;
        self
    }

    pub fn take_profit_enabled(&self) -> bool {
        self.take_profit_pct < DISABLED_RULE_THRESHOLD
    }

    pub fn stop_loss_enabled(&self) -> bool {
        self.stop_loss_pct < DISABLED_RULE_THRESHOLD
    }

    pub fn max_hold_enabled(&self) -> bool {
        (self.max_hold_days as f64) < DISABLED_RULE_THRESHOLD
    }

    /// Bars a trade can stay open; `None` when it may run to the end of the data.
    pub fn hold_limit(&self) -> Option<u32> {
        self.max_hold_enabled().then_some(self.max_hold_days)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.take_profit_pct.is_finite() || self.take_profit_pct <= 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "take_profit_pct must be a positive number (value: {})",
                self.take_profit_pct
            )));
        }
        if !self.stop_loss_pct.is_finite() || self.stop_loss_pct <= 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "stop_loss_pct must be a positive number (value: {})",
                self.stop_loss_pct
            )));
        }
        // A stop at or beyond 100% would put the stop price at or below zero.
        if self.stop_loss_enabled() && self.stop_loss_pct >= 100.0 {
            return Err(EngineError::InvalidInput(format!(
                "stop_loss_pct must be below 100 unless disabled (value: {})",
                self.stop_loss_pct
            )));
        }
        if self.max_hold_days == 0 {
            return Err(EngineError::InvalidInput(
                "max_hold_days must be at least 1".to_string(),
            ));
        }
        if let Some(slippage) = self.slippage_pct {
            if !slippage.is_finite() || !(0.0..100.0).contains(&slippage) {
                return Err(EngineError::InvalidInput(format!(
                    "slippage_pct must be within [0, 100) (value: {})",
                    slippage
                )));
            }
        }
        if let Some(commission) = self.commission {
            if !commission.is_finite() || commission < 0.0 {
                return Err(EngineError::InvalidInput(format!(
                    "commission must be a non-negative number (value: {})",
                    commission
                )));
            }
        }
        Ok(())
    }

    pub fn label(&self) -> String {
        format!(
            "tp={} sl={} hold={}",
            format_rule_value(self.take_profit_pct),
            format_rule_value(self.stop_loss_pct),
            format_rule_value(self.max_hold_days as f64)
        )
    }
}

fn format_rule_value(value: f64) -> String {
    if value >= DISABLED_RULE_THRESHOLD {
        return "off".to_string();
    }
    let formatted = format!("{:.4}", value);
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHold,
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::MaxHold => "max_hold",
            ExitReason::EndOfData => "end_of_data",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedTrade {
    pub ticker: String,
    pub algorithm: String,
    pub entry_date: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_date: DateTime<Utc>,
    pub exit_day_offset: u32,
    pub exit_price: f64,
    pub exit_reason: ExitReason,
    pub shares: i64,
    pub return_pct: f64,
    pub pnl: f64,
}

impl SimulatedTrade {
    pub fn is_win(&self) -> bool {
        self.return_pct >= 0.0
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub trade_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub win_rate_pct: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    pub avg_return_pct: f64,
    pub best_pct: f64,
    pub worst_pct: f64,
    pub total_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterGrid {
    pub take_profit_pcts: Vec<f64>,
    pub stop_loss_pcts: Vec<f64>,
    pub max_hold_days: Vec<u32>,
    #[serde(default)]
    pub slippage_pct: Option<f64>,
    #[serde(default)]
    pub commission: Option<f64>,
}

impl Default for ParameterGrid {
    fn default() -> Self {
        Self {
            take_profit_pcts: vec![
                2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 10.0, 12.0, 15.0, 20.0, 25.0, 999.0,
            ],
            stop_loss_pcts: vec![2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0, 15.0, 999.0],
            max_hold_days: vec![1, 2, 3, 5, 7, 10, 14, 20, 30, 45, 60],
            slippage_pct: None,
            commission: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GridCell {
    pub index: usize,
    pub rules: ExitRuleSet,
}

impl ParameterGrid {
    pub fn total_cells(&self) -> usize {
        self.take_profit_pcts.len() * self.stop_loss_pcts.len() * self.max_hold_days.len()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.take_profit_pcts.is_empty()
            || self.stop_loss_pcts.is_empty()
            || self.max_hold_days.is_empty()
        {
            return Err(EngineError::InvalidInput(
                "parameter grid needs at least one take-profit, stop-loss and max-hold candidate"
                    .to_string(),
            ));
        }
        for cell in self.cells() {
            cell.rules.validate()?;
        }
        Ok(())
    }

    /// Longest hold any cell can reach; `None` if some cell has max-hold disabled.
    pub fn longest_hold(&self) -> Option<u32> {
        let mut longest = 0;
        for &hold in &self.max_hold_days {
            if (hold as f64) >= DISABLED_RULE_THRESHOLD {
                return None;
            }
            longest = longest.max(hold);
        }
        Some(longest)
    }

    /// Cartesian product in declaration order: take-profit outermost, max-hold innermost.
    pub fn cells(&self) -> Vec<GridCell> {
        let mut cells = Vec::with_capacity(self.total_cells());
        for &tp in &self.take_profit_pcts {
            for &sl in &self.stop_loss_pcts {
                for &hold in &self.max_hold_days {
                    cells.push(GridCell {
                        index: cells.len(),
                        rules: ExitRuleSet::new(tp, sl, hold)
                            .with_costs(self.slippage_pct, self.commission),
                    });
                }
            }
        }
        cells
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCell {
    pub grid_index: usize,
    pub rules: ExitRuleSet,
    pub stats: AggregateStats,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub run_id: String,
    pub objective: String,
    pub ranked: Vec<RankedCell>,
    pub profitability_rate: f64,
    pub combos_tested: usize,
    pub combos_total: usize,
    pub picks_evaluated: usize,
    /// Picks left out for short price history or a bad entry price.
    #[serde(default)]
    pub picks_skipped: usize,
    /// Picks whose prices the provider could not serve.
    #[serde(default)]
    pub picks_unavailable: usize,
    pub timed_out: bool,
    pub generated_at: DateTime<Utc>,
}

impl OptimizationResult {
    pub fn best(&self) -> Option<&RankedCell> {
        self.ranked.first()
    }

    pub fn top(&self, n: usize) -> &[RankedCell] {
        &self.ranked[..n.min(self.ranked.len())]
    }

    /// Worst cells first, taken from the tail of the same ranked list as `top`.
    pub fn bottom(&self, n: usize) -> Vec<&RankedCell> {
        self.ranked.iter().rev().take(n).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KellyRecommendation {
    pub full: f64,
    pub half: f64,
    pub quarter: f64,
    pub recommended: f64,
    pub edge: f64,
    pub payoff_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatedPosition {
    pub ticker: String,
    pub algorithm: String,
    pub entry_price: f64,
    pub score: f64,
    pub kelly_fraction: f64,
    pub shares: i64,
    pub position_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPick {
    pub ticker: String,
    pub algorithm: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub capital: f64,
    pub positions: Vec<AllocatedPosition>,
    pub skipped: Vec<SkippedPick>,
    pub total_allocated: f64,
    pub cash_remaining: f64,
    pub allocation_pct: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PickFilter {
    pub algorithm: Option<String>,
    pub lookback_days: Option<i64>,
    pub as_of: Option<NaiveDate>,
}

impl PickFilter {
    pub fn for_algorithm(algorithm: Option<String>) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }
}
