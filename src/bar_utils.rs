use crate::models::PriceBar;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Builds a per-ticker index into `bars`, sorted by date and with duplicate dates dropped.
pub fn build_bar_index(bars: &[PriceBar]) -> HashMap<String, Vec<usize>> {
    let mut index: HashMap<String, Vec<usize>> = HashMap::new();
    for (position, bar) in bars.iter().enumerate() {
        let Some(key) = normalize_ticker_symbol(&bar.ticker) else {
            continue;
        };
        index.entry(key).or_default().push(position);
    }
    for positions in index.values_mut() {
        positions.sort_by_key(|&idx| bars[idx].date);
        positions.dedup_by_key(|idx| bars[*idx].date);
    }
    index
}

/// Keeps bars within `[start, end]` (inclusive); `end = None` keeps everything after `start`.
pub fn bars_in_range<'a, I>(
    bars: I,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Vec<PriceBar>
where
    I: IntoIterator<Item = &'a PriceBar>,
{
    bars.into_iter()
        .filter(|bar| bar.date >= start && end.map_or(true, |end| bar.date <= end))
        .cloned()
        .collect()
}

pub fn is_ascending(bars: &[PriceBar]) -> bool {
    bars.windows(2).all(|pair| pair[0].date <= pair[1].date)
}

/// Bars with non-finite or non-positive prices cannot be simulated against.
pub fn is_usable_bar(bar: &PriceBar) -> bool {
    [bar.open, bar.high, bar.low, bar.close]
        .iter()
        .all(|value| value.is_finite() && *value > 0.0)
}

/// Normalizes a ticker string by trimming whitespace and uppercasing.
pub fn normalize_ticker_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn bar(ticker: &str, day: i64, close: f64) -> PriceBar {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        PriceBar {
            ticker: ticker.to_string(),
            date: base + Duration::days(day),
            open: close,
            high: close,
            low: close,
            close,
            volume_shares: 1_000,
        }
    }

    #[test]
    fn bar_index_drops_duplicate_dates() {
        let bars = vec![bar("AAA", 2, 3.0), bar("AAA", 1, 2.0), bar("AAA", 2, 9.0)];
        let index = build_bar_index(&bars);
        let positions = index.get("AAA").unwrap();
        assert_eq!(positions.len(), 2);
        assert_eq!(bars[positions[0]].close, 2.0);
    }

    #[test]
    fn range_filter_is_inclusive() {
        let bars: Vec<PriceBar> = (0..10).map(|d| bar("AAA", d, 10.0 + d as f64)).collect();
        let start = bars[3].date;
        let end = bars[5].date;
        let slice = bars_in_range(&bars, start, Some(end));
        assert_eq!(slice.len(), 3);
        assert!(is_ascending(&slice));
        assert_eq!(bars_in_range(&bars, start, None).len(), 7);
    }

    #[test]
    fn unusable_bars_are_detected() {
        let mut broken = bar("AAA", 0, 10.0);
        broken.low = f64::NAN;
        assert!(!is_usable_bar(&broken));
        assert!(is_usable_bar(&bar("AAA", 0, 10.0)));
    }
}
