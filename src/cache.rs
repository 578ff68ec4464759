use crate::bar_utils::is_ascending;
use crate::data_context::PriceSeriesProvider;
use crate::error::{EngineError, EngineResult};
use crate::models::{Pick, PriceBar};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type WindowKey = (String, DateTime<Utc>, i64);

/// Slack added on top of the weekday-to-calendar conversion for market holidays.
const HOLIDAY_MARGIN_DAYS: i64 = 14;

/// Calendar days that cover `hold_bars` daily bars after the entry bar.
pub fn calendar_days_for_bars(hold_bars: u32) -> i64 {
    (hold_bars as i64 * 7 + 4) / 5 + HOLIDAY_MARGIN_DAYS
}

/// Lookahead long enough for the longest hold of a run. A configured value of
/// 0, or a run with no hold limit, means unbounded windows.
pub fn window_lookahead(configured_days: i64, longest_hold: Option<u32>) -> i64 {
    match longest_hold {
        Some(hold) if configured_days > 0 => configured_days.max(calendar_days_for_bars(hold)),
        _ => 0,
    }
}

/// Memoizes forward price windows per (ticker, entry date, lookahead).
///
/// Every grid cell replays the same windows, so each one is fetched from the
/// provider at most once per run. Clones share the same map.
#[derive(Clone, Default)]
pub struct PriceWindowCache {
    windows: Arc<DashMap<WindowKey, Arc<Vec<PriceBar>>>>,
    fetches: Arc<AtomicUsize>,
}

impl PriceWindowCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_fetch<P: PriceSeriesProvider + ?Sized>(
        &self,
        provider: &P,
        ticker: &str,
        entry_date: DateTime<Utc>,
        lookahead_days: i64,
    ) -> EngineResult<Arc<Vec<PriceBar>>> {
        // Windows start at midnight so the entry day's bar is always included.
        let start = entry_date.date_naive().and_time(NaiveTime::MIN).and_utc();
        let key = (ticker.to_string(), start, lookahead_days);
        if let Some(window) = self.windows.get(&key) {
            return Ok(Arc::clone(window.value()));
        }

        let end = (lookahead_days > 0).then(|| start + Duration::days(lookahead_days));
        let bars = provider.get_bars(ticker, start, end)?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if !is_ascending(&bars) {
            return Err(EngineError::UpstreamUnavailable {
                ticker: ticker.to_string(),
                reason: "provider returned bars out of date order".to_string(),
            });
        }

        let window = Arc::new(bars);
        self.windows.insert(key, Arc::clone(&window));
        Ok(window)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

}

#[derive(Debug, Clone)]
pub struct PreparedPick {
    pub pick: Pick,
    pub window: Arc<Vec<PriceBar>>,
}

/// Picks paired with their price windows, plus counts of what was left out.
#[derive(Debug, Clone, Default)]
pub struct PreparedPicks {
    pub picks: Vec<PreparedPick>,
    pub insufficient: usize,
    pub unavailable: usize,
    pub invalid: usize,
}

impl PreparedPicks {
    pub fn len(&self) -> usize {
        self.picks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.picks.is_empty()
    }

    pub fn skipped(&self) -> usize {
        self.insufficient + self.unavailable + self.invalid
    }
}

/// Fetches a forward window for every pick and drops the ones that cannot be
/// simulated. Provider failures are per pick and never abort the batch.
///
/// Windows always reach `longest_hold` bars past entry when the data has them,
/// so a trade only ends as `end_of_data` when the series really runs out.
pub fn prepare_picks<P: PriceSeriesProvider + ?Sized>(
    provider: &P,
    cache: &PriceWindowCache,
    picks: &[Pick],
    lookahead_days: i64,
    longest_hold: Option<u32>,
) -> PreparedPicks {
    let lookahead_days = window_lookahead(lookahead_days, longest_hold);
    let required_bars = longest_hold.map_or(2, |hold| hold as usize + 1);
    let mut prepared = PreparedPicks::default();

    for pick in picks {
        if !pick.entry_price.is_finite() || pick.entry_price <= 0.0 {
            debug!(
                "Skipping {} ({}): entry price {} is not positive",
                pick.ticker, pick.algorithm, pick.entry_price
            );
            prepared.invalid += 1;
            continue;
        }

        match fetch_window(provider, cache, pick, lookahead_days, required_bars) {
            Ok(window) if window.len() >= 2 => prepared.picks.push(PreparedPick {
                pick: pick.clone(),
                window,
            }),
            Ok(window) => {
                debug!(
                    "Skipping {} on {}: only {} bar(s) from entry",
                    pick.ticker,
                    pick.entry_date.format("%Y-%m-%d"),
                    window.len()
                );
                prepared.insufficient += 1;
            }
            Err(err) if !err.is_per_pick() => {
                warn!("Skipping {} ({}): {}", pick.ticker, pick.algorithm, err);
                prepared.invalid += 1;
            }
            Err(EngineError::InsufficientData { .. }) => prepared.insufficient += 1,
            Err(err) => {
                warn!("Price data unavailable for {}: {}", pick.ticker, err);
                prepared.unavailable += 1;
            }
        }
    }

    prepared
}

fn fetch_window<P: PriceSeriesProvider + ?Sized>(
    provider: &P,
    cache: &PriceWindowCache,
    pick: &Pick,
    lookahead_days: i64,
    required_bars: usize,
) -> EngineResult<Arc<Vec<PriceBar>>> {
    let window = cache.get_or_fetch(provider, &pick.ticker, pick.entry_date, lookahead_days)?;
    if lookahead_days > 0 && window.len() < required_bars {
        // Sparse data: the bounded window can end before the series does.
        return cache.get_or_fetch(provider, &pick.ticker, pick.entry_date, 0);
    }
    Ok(window)
}
