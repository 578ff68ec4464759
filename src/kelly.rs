use crate::models::{AggregateStats, KellyRecommendation};

/// Floor for the average loss so the payoff ratio never divides by zero.
pub const KELLY_LOSS_EPSILON: f64 = 0.01;
pub const FULL_KELLY_CAP: f64 = 0.25;
pub const MIN_RECOMMENDED_FRACTION: f64 = 0.02;
pub const MAX_RECOMMENDED_FRACTION: f64 = 0.20;

/// Maps win/loss statistics to a bounded capital fraction.
///
/// `recommended` is quarter-Kelly, raised to 2% when any positive edge exists
/// and capped at 20%.
pub fn kelly_fraction(
    win_rate_pct: f64,
    avg_win_pct: f64,
    avg_loss_pct: f64,
) -> KellyRecommendation {
    if !win_rate_pct.is_finite() || !avg_win_pct.is_finite() || !avg_loss_pct.is_finite() {
        return KellyRecommendation::default();
    }

    let p = win_rate_pct / 100.0;
    let q = 1.0 - p;
    if p <= 0.0 || p >= 1.0 {
        return KellyRecommendation::default();
    }

    let avg_loss_abs = avg_loss_pct.abs().max(KELLY_LOSS_EPSILON);
    let b = avg_win_pct / avg_loss_abs;
    let edge = p * b - q;
    if b <= 0.0 {
        // No average win: nothing to stake, but the (negative) edge is still reported.
        return KellyRecommendation {
            edge,
            payoff_ratio: b.max(0.0),
            ..Default::default()
        };
    }

    let full = (edge / b).clamp(0.0, FULL_KELLY_CAP);
    let half = full * 0.5;
    let quarter = full * 0.25;

    let mut recommended = quarter;
    if full > 0.0 && recommended < MIN_RECOMMENDED_FRACTION {
        recommended = MIN_RECOMMENDED_FRACTION;
    }
    if recommended > MAX_RECOMMENDED_FRACTION {
        recommended = MAX_RECOMMENDED_FRACTION;
    }

    KellyRecommendation {
        full,
        half,
        quarter,
        recommended,
        edge,
        payoff_ratio: b,
    }
}

impl KellyRecommendation {
    pub fn from_stats(stats: &AggregateStats) -> Self {
        kelly_fraction(stats.win_rate_pct, stats.avg_win_pct, stats.avg_loss_pct)
    }

    pub fn has_edge(&self) -> bool {
        self.edge > 0.0
    }
}
