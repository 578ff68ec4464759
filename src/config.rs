use crate::kelly::KELLY_LOSS_EPSILON;
use crate::models::{AggregateStats, ParameterGrid};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_RESULT_LIMIT: usize = 20;
pub const MAX_RESULT_LIMIT: usize = 100;
pub const DEFAULT_KELLY_FRACTION: f64 = 0.10;
pub const DEFAULT_MAX_POSITIONS: usize = 10;
/// Calendar days of bars fetched after each entry; covers the longest default hold.
pub const DEFAULT_PRICE_LOOKAHEAD_DAYS: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizationObjective {
    #[default]
    AvgReturn,
    WinRate,
    Edge,
}

impl OptimizationObjective {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "avg_return" | "avg_return_pct" | "return" => Ok(Self::AvgReturn),
            "win_rate" | "win_rate_pct" => Ok(Self::WinRate),
            "edge" | "kelly_edge" => Ok(Self::Edge),
            other => Err(anyhow!(
                "OPTIMIZATION_OBJECTIVE must be avg_return, win_rate or edge (value: {})",
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::AvgReturn => "avg_return",
            Self::WinRate => "win_rate",
            Self::Edge => "edge",
        }
    }

    /// Objective value for one grid cell; non-finite values rank last.
    pub fn score(self, stats: &AggregateStats) -> f64 {
        let score = match self {
            Self::AvgReturn => stats.avg_return_pct,
            Self::WinRate => stats.win_rate_pct,
            Self::Edge => {
                let p = stats.win_rate_pct / 100.0;
                let b = stats.avg_win_pct / stats.avg_loss_pct.abs().max(KELLY_LOSS_EPSILON);
                p * b - (1.0 - p)
            }
        };
        if score.is_finite() {
            score
        } else {
            f64::NEG_INFINITY
        }
    }
}

/// Engine settings resolved from the `settings` table or a snapshot.
///
/// Every key is optional; a missing or blank value falls back to its default,
/// a malformed one is an error.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub objective: OptimizationObjective,
    pub optimizer_timeout: Option<Duration>,
    pub result_limit: usize,
    pub grid: ParameterGrid,
    pub default_kelly_fraction: f64,
    pub max_positions: usize,
    pub pick_lookback_days: Option<i64>,
    pub price_lookahead_days: i64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            objective: OptimizationObjective::default(),
            optimizer_timeout: None,
            result_limit: DEFAULT_RESULT_LIMIT,
            grid: ParameterGrid::default(),
            default_kelly_fraction: DEFAULT_KELLY_FRACTION,
            max_positions: DEFAULT_MAX_POSITIONS,
            pick_lookback_days: None,
            price_lookahead_days: DEFAULT_PRICE_LOOKAHEAD_DAYS,
        }
    }
}

impl EngineSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let objective = match optional_setting(settings, "OPTIMIZATION_OBJECTIVE") {
            Some(raw) => OptimizationObjective::parse(raw)?,
            None => defaults.objective,
        };
        let timeout_seconds = setting_usize_or(settings, "OPTIMIZER_TIMEOUT_SECONDS", 0, 0)?;
        let optimizer_timeout =
            (timeout_seconds > 0).then(|| Duration::from_secs(timeout_seconds as u64));
        let result_limit =
            setting_usize_or(settings, "OPTIMIZER_RESULT_LIMIT", DEFAULT_RESULT_LIMIT, 1)?
                .min(MAX_RESULT_LIMIT);

        let take_profit_pcts = setting_f64_list_or(
            settings,
            "GRID_TAKE_PROFIT_PCTS",
            defaults.grid.take_profit_pcts.clone(),
        )?;
        let stop_loss_pcts = setting_f64_list_or(
            settings,
            "GRID_STOP_LOSS_PCTS",
            defaults.grid.stop_loss_pcts.clone(),
        )?;
        let max_hold_days = match optional_setting(settings, "GRID_MAX_HOLD_DAYS") {
            Some(_) => setting_f64_list_or(settings, "GRID_MAX_HOLD_DAYS", Vec::new())?
                .into_iter()
                .map(|value| whole_days("GRID_MAX_HOLD_DAYS", value))
                .collect::<Result<Vec<u32>>>()?,
            None => defaults.grid.max_hold_days.clone(),
        };
        let slippage_pct = setting_f64_opt(settings, "TRADE_SLIPPAGE_PCT", Some(0.0), Some(100.0))?;
        let commission = setting_f64_opt(settings, "TRADE_COMMISSION", Some(0.0), None)?;

        let default_kelly_fraction = setting_f64_opt(
            settings,
            "DEFAULT_KELLY_FRACTION",
            Some(0.0),
            Some(1.0),
        )?
        .unwrap_or(DEFAULT_KELLY_FRACTION);
        let max_positions =
            setting_usize_or(settings, "MAX_POSITIONS", DEFAULT_MAX_POSITIONS, 0)?;
        let lookback = setting_usize_or(settings, "PICK_LOOKBACK_DAYS", 0, 0)?;
        let pick_lookback_days = (lookback > 0).then_some(lookback as i64);
        let price_lookahead_days = setting_usize_or(
            settings,
            "PRICE_LOOKAHEAD_DAYS",
            DEFAULT_PRICE_LOOKAHEAD_DAYS as usize,
            0,
        )? as i64;

        let grid = ParameterGrid {
            take_profit_pcts,
            stop_loss_pcts,
            max_hold_days,
            slippage_pct,
            commission,
        };
        grid.validate()
            .map_err(|err| anyhow!("Invalid grid settings: {}", err))?;

        Ok(Self {
            objective,
            optimizer_timeout,
            result_limit,
            grid,
            default_kelly_fraction,
            max_positions,
            pick_lookback_days,
            price_lookahead_days,
        })
    }
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn setting_f64_opt(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn setting_usize_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: usize,
    min: usize,
) -> Result<usize> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value as usize)
}

fn setting_f64_list_or(
    settings: &HashMap<String, String>,
    key: &str,
    default: Vec<f64>,
) -> Result<Vec<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(default);
    };
    parse_f64_list(raw).map_err(|reason| anyhow!("Setting {} {} (value: {})", key, reason, raw))
}

/// Parses `"[2, 3.5 999]"`-style lists; brackets optional, comma or whitespace separated.
pub fn parse_f64_list(raw: &str) -> std::result::Result<Vec<f64>, String> {
    let trimmed = raw.trim().trim_matches(|c| c == '[' || c == ']');
    let mut values = Vec::new();

    for part in trimmed.split(|c: char| c == ',' || c.is_whitespace()) {
        let entry = part.trim();
        if entry.is_empty() {
            continue;
        }
        let value = entry
            .parse::<f64>()
            .map_err(|_| "must be a list of numbers".to_string())?;
        if !value.is_finite() {
            return Err("must contain only finite numbers".to_string());
        }
        values.push(value);
    }

    if values.is_empty() {
        return Err("must contain at least one number".to_string());
    }
    Ok(values)
}

fn whole_days(key: &str, value: f64) -> Result<u32> {
    if value < 1.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(anyhow!(
            "Setting {} must contain whole day counts >= 1 (value: {})",
            key,
            value
        ));
    }
    Ok(value as u32)
}
