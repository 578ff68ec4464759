use crate::error::{EngineError, EngineResult};
use crate::models::{ExitReason, ExitRuleSet, Pick, PriceBar, SimulatedTrade};
use chrono::{DateTime, Utc};

const MIN_WINDOW_BARS: usize = 2;

/// Returns the bars from the entry day onwards of an ascending series.
/// Bars are compared by calendar day, so an entry timestamp later in the day
/// still keeps that day's bar.
pub fn price_window(bars: &[PriceBar], entry_date: DateTime<Utc>) -> &[PriceBar] {
    let entry_day = entry_date.date_naive();
    let start = bars.partition_point(|bar| bar.date.date_naive() < entry_day);
    &bars[start..]
}

/// Replays one pick forward through its price window under `rules`.
///
/// A bar on the entry day is the entry bar and is never checked; each bar
/// after it is one holding day. When the entry day has no bar (weekend,
/// holiday, data gap) the first bar after it is already holding day 1.
/// Stop-loss is checked before take-profit, so a bar that breaches both
/// exits at the stop.
pub fn simulate(
    pick: &Pick,
    window: &[PriceBar],
    rules: &ExitRuleSet,
) -> EngineResult<SimulatedTrade> {
    if !pick.entry_price.is_finite() || pick.entry_price <= 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "entry price for {} must be positive (value: {})",
            pick.ticker, pick.entry_price
        )));
    }
    rules.validate()?;

    let window = price_window(window, pick.entry_date);
    if window.len() < MIN_WINDOW_BARS {
        return Err(EngineError::InsufficientData {
            ticker: pick.ticker.clone(),
            bars: window.len(),
        });
    }

    let slippage_ratio = rules.slippage_pct.unwrap_or(0.0) / 100.0;
    let effective_entry = pick.entry_price * (1.0 + slippage_ratio);
    let tp_price = effective_entry * (1.0 + rules.take_profit_pct / 100.0);
    let sl_price = effective_entry * (1.0 - rules.stop_loss_pct / 100.0);

    let walk_start = usize::from(window[0].date.date_naive() == pick.entry_date.date_naive());
    let day_count_at = |index: usize| (index + 1 - walk_start) as u32;

    let mut exit: Option<(u32, &PriceBar, f64, ExitReason)> = None;
    for (offset, bar) in window.iter().enumerate().skip(walk_start) {
        let day_count = day_count_at(offset);
        if rules.stop_loss_enabled() && bar.low <= sl_price {
            exit = Some((day_count, bar, sl_price, ExitReason::StopLoss));
            break;
        }
        if rules.take_profit_enabled() && bar.high >= tp_price {
            exit = Some((day_count, bar, tp_price, ExitReason::TakeProfit));
            break;
        }
        if rules.max_hold_enabled() && day_count >= rules.max_hold_days {
            exit = Some((day_count, bar, bar.close, ExitReason::MaxHold));
            break;
        }
    }

    let (exit_day_offset, exit_bar, raw_exit, exit_reason) = match exit {
        Some(found) => found,
        None => {
            let last_index = window.len() - 1;
            let last = &window[last_index];
            (day_count_at(last_index), last, last.close, ExitReason::EndOfData)
        }
    };

    let effective_exit = raw_exit * (1.0 - slippage_ratio);
    let return_pct = (effective_exit - effective_entry) / effective_entry * 100.0;
    let shares = pick.share_count();
    let commission = rules.commission.unwrap_or(0.0);
    let pnl = (effective_exit - effective_entry) * shares as f64 - 2.0 * commission;

    Ok(SimulatedTrade {
        ticker: pick.ticker.clone(),
        algorithm: pick.algorithm.clone(),
        entry_date: pick.entry_date,
        entry_price: effective_entry,
        exit_date: exit_bar.date,
        exit_day_offset,
        exit_price: effective_exit,
        exit_reason,
        shares,
        return_pct,
        pnl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn pick(entry_price: f64) -> Pick {
        Pick {
            ticker: "TEST".to_string(),
            entry_date: base_date(),
            entry_price,
            algorithm: "momentum".to_string(),
            score: None,
            shares: None,
        }
    }

    // Entry bar at day 0, then one bar per (high, low, close) tuple.
    fn window(entry_close: f64, days: &[(f64, f64, f64)]) -> Vec<PriceBar> {
        let mut bars = vec![PriceBar {
            ticker: "TEST".to_string(),
            date: base_date(),
            open: entry_close,
            high: entry_close,
            low: entry_close,
            close: entry_close,
            volume_shares: 1_000,
        }];
        for (i, &(high, low, close)) in days.iter().enumerate() {
            bars.push(PriceBar {
                ticker: "TEST".to_string(),
                date: base_date() + Duration::days(i as i64 + 1),
                open: close,
                high,
                low,
                close,
                volume_shares: 1_000,
            });
        }
        bars
    }

    #[test]
    fn stop_loss_hit_on_second_day() {
        let bars = window(
            100.0,
            &[
                (101.0, 99.0, 100.0),
                (100.0, 94.0, 95.5),
                (99.0, 90.0, 91.0),
                (92.0, 88.0, 89.0),
                (90.0, 85.0, 86.0),
            ],
        );
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 5)).unwrap();

        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert_eq!(trade.exit_day_offset, 2);
        assert!((trade.exit_price - 95.0).abs() < 1e-9);
        assert!((trade.return_pct + 5.0).abs() < 1e-9);
    }

    #[test]
    fn take_profit_hit_with_stop_disabled() {
        let bars = window(
            100.0,
            &[
                (101.0, 60.0, 100.0),
                (103.0, 70.0, 102.0),
                (112.0, 99.0, 108.0),
                (115.0, 105.0, 110.0),
            ],
        );
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 999.0, 30)).unwrap();

        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.exit_day_offset, 3);
        assert!((trade.exit_price - 110.0).abs() < 1e-9);
        assert!((trade.return_pct - 10.0).abs() < 1e-9);
    }

    #[test]
    fn same_day_breach_exits_at_stop() {
        let bars = window(100.0, &[(120.0, 80.0, 100.0)]);
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 5)).unwrap();

        assert_eq!(trade.exit_reason, ExitReason::StopLoss);
        assert!((trade.return_pct + 5.0).abs() < 1e-9);
    }

    #[test]
    fn max_hold_exits_at_close() {
        let bars = window(
            100.0,
            &[(101.0, 99.0, 100.5), (102.0, 99.5, 101.5), (103.0, 100.0, 102.0)],
        );
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 2)).unwrap();

        assert_eq!(trade.exit_reason, ExitReason::MaxHold);
        assert_eq!(trade.exit_day_offset, 2);
        assert!((trade.exit_price - 101.5).abs() < 1e-9);
    }

    #[test]
    fn exhausted_window_exits_at_last_close() {
        let bars = window(100.0, &[(101.0, 99.0, 100.5), (102.0, 99.5, 97.0)]);
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 20)).unwrap();

        assert_eq!(trade.exit_reason, ExitReason::EndOfData);
        assert_eq!(trade.exit_day_offset, 2);
        assert!((trade.exit_price - 97.0).abs() < 1e-9);
        assert!((trade.return_pct + 3.0).abs() < 1e-9);
    }

    #[test]
    fn disabled_max_hold_runs_to_end_of_data() {
        let bars = window(100.0, &[(101.0, 99.0, 100.0), (101.0, 99.0, 100.0)]);
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(999.0, 999.0, 999)).unwrap();

        assert_eq!(trade.exit_reason, ExitReason::EndOfData);
    }

    #[test]
    fn slippage_and_commission_adjust_prices_and_pnl() {
        let bars = window(100.0, &[(101.0, 99.0, 100.0), (101.0, 99.0, 100.0)]);
        let rules = ExitRuleSet::new(50.0, 50.0, 2).with_costs(Some(1.0), Some(2.5));
        let mut entry = pick(100.0);
        entry.shares = Some(10);
        let trade = simulate(&entry, &bars, &rules).unwrap();

        assert!((trade.entry_price - 101.0).abs() < 1e-9);
        assert!((trade.exit_price - 99.0).abs() < 1e-9);
        let expected_return = (99.0 - 101.0) / 101.0 * 100.0;
        assert!((trade.return_pct - expected_return).abs() < 1e-9);
        assert!((trade.pnl - (-20.0 - 5.0)).abs() < 1e-9);
    }

    #[test]
    fn bars_before_entry_are_ignored() {
        let mut bars = window(100.0, &[(101.0, 99.0, 104.0)]);
        bars.insert(
            0,
            PriceBar {
                ticker: "TEST".to_string(),
                date: base_date() - Duration::days(1),
                open: 10.0,
                high: 10.0,
                low: 1.0,
                close: 10.0,
                volume_shares: 1_000,
            },
        );
        let trade = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 1)).unwrap();
        assert_eq!(trade.exit_reason, ExitReason::MaxHold);
        assert!((trade.exit_price - 104.0).abs() < 1e-9);
    }

    #[test]
    fn entry_without_a_bar_counts_the_next_bar_as_day_one() {
        let bars = window(100.0, &[(101.0, 99.0, 104.0)]);
        let mut weekend = pick(100.0);
        weekend.entry_date = base_date() - Duration::days(2);
        let trade = simulate(&weekend, &bars, &ExitRuleSet::new(10.0, 5.0, 1)).unwrap();
        assert_eq!(trade.exit_reason, ExitReason::MaxHold);
        assert_eq!(trade.exit_date, base_date());
        assert_eq!(trade.exit_day_offset, 1);

        let mut intraday = pick(100.0);
        intraday.entry_date = base_date() + Duration::hours(15);
        let trade = simulate(&intraday, &bars, &ExitRuleSet::new(10.0, 5.0, 1)).unwrap();
        assert_eq!(trade.exit_date, base_date() + Duration::days(1));
        assert!((trade.exit_price - 104.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_short_windows_and_bad_prices() {
        let bars = window(100.0, &[]);
        let err = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 5)).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientData {
                ticker: "TEST".to_string(),
                bars: 1
            }
        );

        let bars = window(100.0, &[(101.0, 99.0, 100.0)]);
        let err = simulate(&pick(0.0), &bars, &ExitRuleSet::new(10.0, 5.0, 5)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let err = simulate(&pick(100.0), &bars, &ExitRuleSet::new(10.0, 5.0, 0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }
}
