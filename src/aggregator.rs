use crate::models::{AggregateStats, SimulatedTrade};

/// Running sums over simulated trades.
///
/// Only counts and sums are kept, so partial tallies from parallel workers
/// merge to the same result in any order. Averages are taken in `finish`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeTally {
    pub trade_count: u32,
    pub win_count: u32,
    pub loss_count: u32,
    pub sum_win_pct: f64,
    pub sum_loss_pct: f64,
    pub sum_return_pct: f64,
    pub best_pct: f64,
    pub worst_pct: f64,
    pub total_pnl: f64,
}

impl Default for TradeTally {
    fn default() -> Self {
        Self {
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            sum_win_pct: 0.0,
            sum_loss_pct: 0.0,
            sum_return_pct: 0.0,
            best_pct: f64::NEG_INFINITY,
            worst_pct: f64::INFINITY,
            total_pnl: 0.0,
        }
    }
}

impl TradeTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, trade: &SimulatedTrade) {
        self.push_return(trade.return_pct, trade.pnl);
    }

    pub fn push_return(&mut self, return_pct: f64, pnl: f64) {
        if !return_pct.is_finite() {
            return;
        }
        self.trade_count += 1;
        // Break-even counts as a win.
        if return_pct >= 0.0 {
            self.win_count += 1;
            self.sum_win_pct += return_pct;
        } else {
            self.loss_count += 1;
            self.sum_loss_pct += return_pct.abs();
        }
        self.sum_return_pct += return_pct;
        self.best_pct = self.best_pct.max(return_pct);
        self.worst_pct = self.worst_pct.min(return_pct);
        if pnl.is_finite() {
            self.total_pnl += pnl;
        }
    }

    pub fn merge(mut self, other: TradeTally) -> TradeTally {
        self.trade_count += other.trade_count;
        self.win_count += other.win_count;
        self.loss_count += other.loss_count;
        self.sum_win_pct += other.sum_win_pct;
        self.sum_loss_pct += other.sum_loss_pct;
        self.sum_return_pct += other.sum_return_pct;
        self.best_pct = self.best_pct.max(other.best_pct);
        self.worst_pct = self.worst_pct.min(other.worst_pct);
        self.total_pnl += other.total_pnl;
        self
    }

    pub fn finish(&self) -> AggregateStats {
        if self.trade_count == 0 {
            return AggregateStats::default();
        }

        AggregateStats {
            trade_count: self.trade_count,
            win_count: self.win_count,
            loss_count: self.loss_count,
            win_rate_pct: ratio(self.win_count as f64, self.trade_count) * 100.0,
            avg_win_pct: ratio(self.sum_win_pct, self.win_count),
            avg_loss_pct: ratio(self.sum_loss_pct, self.loss_count),
            avg_return_pct: ratio(self.sum_return_pct, self.trade_count),
            best_pct: self.best_pct,
            worst_pct: self.worst_pct,
            total_pnl: self.total_pnl,
        }
    }
}

fn ratio(sum: f64, count: u32) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

pub fn aggregate(trades: &[SimulatedTrade]) -> AggregateStats {
    let mut tally = TradeTally::new();
    for trade in trades {
        tally.push(trade);
    }
    tally.finish()
}

/// Longest run of consecutive losing trades in the given order.
pub fn max_loss_streak(trades: &[SimulatedTrade]) -> u32 {
    let mut longest = 0;
    let mut current = 0;
    for trade in trades {
        if trade.is_win() {
            current = 0;
        } else {
            current += 1;
            longest = longest.max(current);
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExitReason;
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use statrs::statistics::Statistics;

    fn trade(return_pct: f64) -> SimulatedTrade {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        SimulatedTrade {
            ticker: "AAA".to_string(),
            algorithm: "alpha".to_string(),
            entry_date: date,
            entry_price: 100.0,
            exit_date: date,
            exit_day_offset: 1,
            exit_price: 100.0 + return_pct,
            exit_reason: ExitReason::MaxHold,
            shares: 1,
            return_pct,
            pnl: return_pct,
        }
    }

    #[test]
    fn empty_input_yields_zero_stats() {
        let stats = aggregate(&[]);
        assert_eq!(stats, AggregateStats::default());
        assert_eq!(stats.best_pct, 0.0);
        assert_eq!(stats.worst_pct, 0.0);
    }

    #[test]
    fn break_even_counts_as_win() {
        let stats = aggregate(&[trade(0.0), trade(-4.0), trade(6.0)]);
        assert_eq!(stats.trade_count, 3);
        assert_eq!(stats.win_count, 2);
        assert_eq!(stats.loss_count, 1);
        assert!((stats.win_rate_pct - 200.0 / 3.0).abs() < 1e-9);
        assert!((stats.avg_win_pct - 3.0).abs() < 1e-9);
        assert!((stats.avg_loss_pct - 4.0).abs() < 1e-9);
        assert!((stats.avg_return_pct - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.best_pct, 6.0);
        assert_eq!(stats.worst_pct, -4.0);
    }

    #[test]
    fn all_losers_have_zero_average_win() {
        let stats = aggregate(&[trade(-1.0), trade(-3.0)]);
        assert_eq!(stats.win_count, 0);
        assert_eq!(stats.avg_win_pct, 0.0);
        assert!((stats.avg_loss_pct - 2.0).abs() < 1e-9);
        assert_eq!(stats.win_rate_pct, 0.0);
    }

    #[test]
    fn counts_and_mean_hold_for_random_lists() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let len = rng.gen_range(1..60);
            let returns: Vec<f64> = (0..len).map(|_| rng.gen_range(-25.0..25.0)).collect();
            let trades: Vec<SimulatedTrade> = returns.iter().map(|r| trade(*r)).collect();
            let stats = aggregate(&trades);

            assert_eq!(stats.win_count + stats.loss_count, stats.trade_count);
            assert_eq!(stats.trade_count as usize, trades.len());
            let expected_mean = returns.iter().copied().mean();
            assert!((stats.avg_return_pct - expected_mean).abs() < 1e-9);
        }
    }

    #[test]
    fn merge_order_does_not_change_result() {
        let mut rng = StdRng::seed_from_u64(11);
        let trades: Vec<SimulatedTrade> =
            (0..90).map(|_| trade(rng.gen_range(-10.0..10.0))).collect();

        let mut partials: Vec<TradeTally> = trades
            .chunks(7)
            .map(|chunk| {
                let mut tally = TradeTally::new();
                chunk.iter().for_each(|t| tally.push(t));
                tally
            })
            .collect();

        let forward = partials
            .iter()
            .fold(TradeTally::new(), |acc, part| acc.merge(*part))
            .finish();
        partials.reverse();
        let backward = partials
            .iter()
            .fold(TradeTally::new(), |acc, part| acc.merge(*part))
            .finish();

        let direct = aggregate(&trades);
        assert_eq!(forward.trade_count, direct.trade_count);
        assert_eq!(forward.win_count, backward.win_count);
        assert!((forward.avg_return_pct - backward.avg_return_pct).abs() < 1e-9);
        assert!((forward.avg_return_pct - direct.avg_return_pct).abs() < 1e-9);
        assert_eq!(forward.best_pct, direct.best_pct);
        assert_eq!(forward.worst_pct, direct.worst_pct);
    }

    #[test]
    fn loss_streak_tracks_longest_run() {
        let trades = vec![
            trade(-1.0),
            trade(2.0),
            trade(-1.0),
            trade(-2.0),
            trade(-0.5),
            trade(0.0),
            trade(-3.0),
        ];
        assert_eq!(max_loss_streak(&trades), 3);
        assert_eq!(max_loss_streak(&[]), 0);
    }
}
