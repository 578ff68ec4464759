use crate::bar_utils::{bars_in_range, build_bar_index, is_usable_bar, normalize_ticker_symbol};
use crate::database::Database;
use crate::error::{EngineError, EngineResult};
use crate::models::{Pick, PickFilter, PriceBar};
use crate::optimizer_status::OptimizerStatus;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;
const SNAPSHOT_ALLOWED_SETTINGS: [&str; 12] = [
    "DEFAULT_KELLY_FRACTION",
    "GRID_MAX_HOLD_DAYS",
    "GRID_STOP_LOSS_PCTS",
    "GRID_TAKE_PROFIT_PCTS",
    "MAX_POSITIONS",
    "OPTIMIZATION_OBJECTIVE",
    "OPTIMIZER_RESULT_LIMIT",
    "OPTIMIZER_TIMEOUT_SECONDS",
    "PICK_LOOKBACK_DAYS",
    "PRICE_LOOKAHEAD_DAYS",
    "TRADE_COMMISSION",
    "TRADE_SLIPPAGE_PCT",
];

/// Supplies ascending daily bars for one ticker.
pub trait PriceSeriesProvider: Send + Sync {
    fn get_bars(
        &self,
        ticker: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<PriceBar>>;
}

/// Supplies trade candidates, optionally filtered by algorithm and lookback.
pub trait PickSource {
    fn picks(&self, filter: &PickFilter) -> Vec<Pick>;
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    bars: Vec<PriceBar>,
    picks: Vec<Pick>,
    #[serde(default)]
    settings: HashMap<String, String>,
}

fn scrub_snapshot_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    settings
        .iter()
        .filter(|(key, _)| SNAPSHOT_ALLOWED_SETTINGS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// In-memory bars, picks and settings shared read-only across workers.
#[derive(Clone)]
pub struct MarketData {
    bars: Arc<Vec<PriceBar>>,
    bars_by_ticker_indices: Arc<HashMap<String, Vec<usize>>>,
    picks: Arc<Vec<Pick>>,
    settings: Arc<HashMap<String, String>>,
}

impl MarketData {
    pub fn from_parts(
        bars: Vec<PriceBar>,
        picks: Vec<Pick>,
        settings: HashMap<String, String>,
    ) -> Result<Self> {
        let total_bars = bars.len();
        let bars: Vec<PriceBar> = bars.into_iter().filter(is_usable_bar).collect();
        if bars.len() < total_bars {
            warn!(
                "Dropped {} bar(s) with non-positive or non-finite prices",
                total_bars - bars.len()
            );
        }
        if bars.is_empty() {
            return Err(anyhow!("Market data has no usable price bars"));
        }

        let mut picks = picks;
        for pick in &mut picks {
            if let Some(ticker) = normalize_ticker_symbol(&pick.ticker) {
                pick.ticker = ticker;
            }
        }
        picks.sort_by(|a, b| {
            a.entry_date
                .cmp(&b.entry_date)
                .then_with(|| a.ticker.cmp(&b.ticker))
                .then_with(|| a.algorithm.cmp(&b.algorithm))
        });

        let bars_by_ticker_indices = build_bar_index(&bars);
        Ok(Self {
            bars: Arc::new(bars),
            bars_by_ticker_indices: Arc::new(bars_by_ticker_indices),
            picks: Arc::new(picks),
            settings: Arc::new(settings),
        })
    }

    /// Loads picks matching `filter` and the bars for their tickers in one pass.
    pub async fn load(db: &Database, filter: &PickFilter) -> Result<Self> {
        info!("Loading picks from database...");
        let picks = db.get_picks(filter).await?;
        if picks.is_empty() {
            return Err(anyhow!("No picks matched the requested filter"));
        }

        let tickers: Vec<String> = picks
            .iter()
            .map(|pick| pick.ticker.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let earliest_entry = picks
            .iter()
            .map(|pick| pick.entry_date)
            .min()
            .unwrap_or_else(Utc::now);

        info!(
            "Loading price bars for {} ticker(s) from {}...",
            tickers.len(),
            earliest_entry.format("%Y-%m-%d")
        );
        let bars = db.get_bars_for_tickers(&tickers, earliest_entry).await?;
        let settings = db.get_all_settings().await?;

        info!(
            "Loaded {} bars and {} picks across {} tickers",
            bars.len(),
            picks.len(),
            tickers.len()
        );

        Self::from_parts(bars, picks, settings)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P, status: &OptimizerStatus) -> Result<Self> {
        let path = path.as_ref();
        status.set_phase(format!(
            "Loading market data snapshot from {}",
            path.display()
        ));
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot =
            bincode::deserialize_from(reader).context("Snapshot decode failed")?;

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        status.set_phase("Reconstructing market data snapshot");
        info!(
            "Snapshot generated at {} holds {} bars and {} picks",
            snapshot.generated_at.format("%Y-%m-%d %H:%M"),
            snapshot.bars.len(),
            snapshot.picks.len()
        );
        Self::from_parts(snapshot.bars, snapshot.picks, snapshot.settings)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            bars: self.bars.as_ref().clone(),
            picks: self.picks.as_ref().clone(),
            settings: scrub_snapshot_settings(self.settings.as_ref()),
        };
        bincode::serialize_into(&mut writer, &snapshot)
            .context("Failed to serialize market data snapshot")?;
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }

    pub fn bars(&self) -> &[PriceBar] {
        self.bars.as_slice()
    }

    pub fn all_picks(&self) -> &[Pick] {
        self.picks.as_slice()
    }

    pub fn tickers(&self) -> Vec<String> {
        let mut tickers: Vec<String> = self.bars_by_ticker_indices.keys().cloned().collect();
        tickers.sort();
        tickers
    }

    pub fn settings(&self) -> &HashMap<String, String> {
        self.settings.as_ref()
    }

    pub fn setting_value(&self, setting_key: &str) -> Option<&str> {
        self.settings
            .as_ref()
            .get(setting_key)
            .map(|value| value.as_str())
    }
}

impl PriceSeriesProvider for MarketData {
    fn get_bars(
        &self,
        ticker: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<PriceBar>> {
        let Some(key) = normalize_ticker_symbol(ticker) else {
            return Err(EngineError::InvalidInput("ticker must not be empty".to_string()));
        };
        let Some(indices) = self.bars_by_ticker_indices.get(&key) else {
            return Ok(Vec::new());
        };
        let all = self.bars.as_slice();
        Ok(bars_in_range(indices.iter().map(|&idx| &all[idx]), start, end))
    }
}

impl PickSource for MarketData {
    fn picks(&self, filter: &PickFilter) -> Vec<Pick> {
        let by_algorithm: Vec<&Pick> = self
            .picks
            .iter()
            .filter(|pick| {
                filter
                    .algorithm
                    .as_deref()
                    .map_or(true, |algorithm| pick.algorithm.eq_ignore_ascii_case(algorithm))
            })
            .collect();

        let Some(lookback_days) = filter.lookback_days.filter(|days| *days > 0) else {
            return by_algorithm.into_iter().cloned().collect();
        };

        let reference = match filter.as_of {
            Some(date) => date.and_time(NaiveTime::MIN).and_utc(),
            None => match by_algorithm.iter().map(|pick| pick.entry_date).max() {
                Some(latest) => latest,
                None => return Vec::new(),
            },
        };
        let cutoff = reference - Duration::days(lookback_days);

        by_algorithm
            .into_iter()
            .filter(|pick| pick.entry_date >= cutoff && pick.entry_date <= reference)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn bar(ticker: &str, day: i64, close: f64) -> PriceBar {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        PriceBar {
            ticker: ticker.to_string(),
            date: base + Duration::days(day),
            open: close,
            high: close,
            low: close,
            close,
            volume_shares: 500,
        }
    }

    fn pick(ticker: &str, day: i64, algorithm: &str) -> Pick {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Pick {
            ticker: ticker.to_string(),
            entry_date: base + Duration::days(day),
            entry_price: 10.0,
            algorithm: algorithm.to_string(),
            score: None,
            shares: None,
        }
    }

    fn market_data() -> MarketData {
        let mut bars: Vec<PriceBar> = (0..20).map(|d| bar("AAA", d, 10.0 + d as f64)).collect();
        bars.push(bar("BBB", 0, 0.0));
        bars.push(bar("BBB", 1, 5.0));
        let picks = vec![
            pick("aaa", 15, "momentum"),
            pick("AAA", 2, "momentum"),
            pick("BBB", 1, "value"),
        ];
        MarketData::from_parts(bars, picks, HashMap::new()).unwrap()
    }

    #[test]
    fn provider_returns_ascending_range() {
        let data = market_data();
        let start = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
        let bars = data.get_bars("aaa", start, Some(end)).unwrap();
        assert_eq!(bars.len(), 4);
        assert!(bars.windows(2).all(|w| w[0].date < w[1].date));
        assert!(data.get_bars("ZZZ", start, None).unwrap().is_empty());
    }

    #[test]
    fn unusable_bars_are_dropped_on_load() {
        let data = market_data();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(data.get_bars("BBB", start, None).unwrap().len(), 1);
    }

    #[test]
    fn picks_filter_by_algorithm_and_lookback() {
        let data = market_data();
        let all = data.picks(&PickFilter::default());
        assert_eq!(all.len(), 3);
        assert!(all[0].entry_date <= all[1].entry_date);
        assert_eq!(all[2].ticker, "AAA");

        let momentum = data.picks(&PickFilter::for_algorithm(Some("MOMENTUM".to_string())));
        assert_eq!(momentum.len(), 2);

        let recent = data.picks(&PickFilter {
            algorithm: Some("momentum".to_string()),
            lookback_days: Some(5),
            as_of: None,
        });
        assert_eq!(recent.len(), 1);

        let as_of = data.picks(&PickFilter {
            algorithm: None,
            lookback_days: Some(3),
            as_of: NaiveDate::from_ymd_opt(2024, 1, 3),
        });
        assert_eq!(as_of.len(), 2);
    }

    #[test]
    fn snapshot_round_trip_keeps_allowed_settings() {
        let mut settings = HashMap::new();
        settings.insert("OPTIMIZATION_OBJECTIVE".to_string(), "win_rate".to_string());
        settings.insert("ADMIN_KEY".to_string(), "secret".to_string());
        let data = MarketData::from_parts(
            (0..5).map(|d| bar("AAA", d, 10.0)).collect(),
            vec![pick("AAA", 0, "momentum")],
            settings,
        )
        .unwrap();

        let path = std::env::temp_dir().join(format!(
            "pick-engine-snapshot-{}.bin",
            uuid::Uuid::new_v4()
        ));
        data.save_to_file(&path).unwrap();
        let loaded = MarketData::load_from_file(&path, &OptimizerStatus::new()).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.bars().len(), 5);
        assert_eq!(loaded.all_picks().len(), 1);
        assert_eq!(loaded.setting_value("OPTIMIZATION_OBJECTIVE"), Some("win_rate"));
        assert!(loaded.setting_value("ADMIN_KEY").is_none());
    }
}
