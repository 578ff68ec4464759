use crate::cache::{prepare_picks, PreparedPicks, PriceWindowCache};
use crate::config::EngineSettings;
use crate::data_context::{MarketData, PickSource};
use crate::database::Database;
use crate::models::PickFilter;
use crate::optimizer::GridOptimizer;
use crate::optimizer_status::OptimizerStatus;
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppContext {
    database_url: Option<String>,
}

impl AppContext {
    pub async fn initialize(database_url: Option<String>) -> Result<Self> {
        let database_url = database_url
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        Ok(Self { database_url })
    }

    pub async fn database(&self) -> Result<Database> {
        let Some(database_url) = self.database_url.as_deref() else {
            return Err(anyhow!(
                "DATABASE_URL must be set to use database-backed engine commands."
            ));
        };
        Database::new(database_url).await
    }

    /// Loads market data from a snapshot when `data_file` is given, otherwise from the database.
    pub async fn engine_context(
        &self,
        data_file: Option<&Path>,
        algorithm: Option<String>,
    ) -> Result<EngineContext> {
        match data_file {
            Some(path) => {
                EngineContext::initialize_with_market_data_file(
                    self.database_url.as_deref(),
                    path,
                    algorithm,
                )
                .await
            }
            None => {
                let database_url = self.database_url.as_deref().ok_or_else(|| {
                    anyhow!("DATABASE_URL must be set to load market data from the database.")
                })?;
                EngineContext::initialize(database_url, algorithm).await
            }
        }
    }
}

/// Market data, settings and shared caches for one command invocation.
pub struct EngineContext {
    db: Option<Database>,
    market_data: MarketData,
    settings: EngineSettings,
    filter: PickFilter,
    window_cache: PriceWindowCache,
    status: OptimizerStatus,
}

impl EngineContext {
    pub async fn initialize<S: AsRef<str>>(
        database_url: S,
        algorithm: Option<String>,
    ) -> Result<Self> {
        let status = OptimizerStatus::new();
        status.set_phase("Connecting to database");
        let db = Database::new(database_url).await?;

        let settings = EngineSettings::from_settings_map(&db.get_all_settings().await?)
            .context("Invalid engine settings")?;
        let filter = PickFilter {
            algorithm,
            lookback_days: settings.pick_lookback_days,
            as_of: None,
        };

        status.set_phase("Loading market data");
        let market_data = MarketData::load(&db, &filter).await?;
        Ok(Self::from_components(Some(db), market_data, settings, filter, status))
    }

    pub async fn initialize_with_market_data_file<P: AsRef<Path>>(
        database_url: Option<&str>,
        data_file: P,
        algorithm: Option<String>,
    ) -> Result<Self> {
        let status = OptimizerStatus::new();
        status.set_phase("Connecting to database");
        let db = match database_url {
            Some(url) if !url.trim().is_empty() => match Database::new(url).await {
                Ok(db) => Some(db),
                Err(error) => {
                    warn!(
                        "Database connection unavailable ({}). Continuing with local market data snapshot only.",
                        error
                    );
                    None
                }
            },
            _ => {
                warn!("Database URL not provided. Using local market data snapshot only.");
                None
            }
        };

        let market_data = MarketData::load_from_file(data_file, &status)?;
        let settings = match db.as_ref() {
            Some(db) => db.get_all_settings().await?,
            None => market_data.settings().clone(),
        };
        let settings =
            EngineSettings::from_settings_map(&settings).context("Invalid engine settings")?;
        let filter = PickFilter {
            algorithm,
            lookback_days: settings.pick_lookback_days,
            as_of: None,
        };
        Ok(Self::from_components(db, market_data, settings, filter, status))
    }

    pub fn from_market_data(market_data: MarketData, algorithm: Option<String>) -> Result<Self> {
        let settings = EngineSettings::from_settings_map(market_data.settings())
            .context("Invalid engine settings")?;
        let filter = PickFilter {
            algorithm,
            lookback_days: settings.pick_lookback_days,
            as_of: None,
        };
        Ok(Self::from_components(
            None,
            market_data,
            settings,
            filter,
            OptimizerStatus::new(),
        ))
    }

    fn from_components(
        db: Option<Database>,
        market_data: MarketData,
        settings: EngineSettings,
        filter: PickFilter,
        status: OptimizerStatus,
    ) -> Self {
        status.set_phase("Idle");
        Self {
            db,
            market_data,
            settings,
            filter,
            window_cache: PriceWindowCache::new(),
            status,
        }
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    pub fn market_data(&self) -> &MarketData {
        &self.market_data
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn filter(&self) -> &PickFilter {
        &self.filter
    }

    pub fn optimizer(&self) -> GridOptimizer {
        GridOptimizer::new(self.status.clone())
    }

    /// Fetches every selected pick's forward window once. All I/O for a run
    /// happens here, before any simulation starts. `longest_hold` is the
    /// longest holding period the run can reach, `None` when unlimited.
    pub fn prepare_picks(&self, longest_hold: Option<u32>) -> Result<Arc<PreparedPicks>> {
        self.status.set_phase("Preparing price windows");
        let picks = self.market_data.picks(&self.filter);
        if picks.is_empty() {
            return Err(anyhow!(
                "No picks found{}",
                self.filter
                    .algorithm
                    .as_deref()
                    .map(|algorithm| format!(" for algorithm {}", algorithm))
                    .unwrap_or_default()
            ));
        }

        let prepared = prepare_picks(
            &self.market_data,
            &self.window_cache,
            &picks,
            self.settings.price_lookahead_days,
            longest_hold,
        );
        if prepared.skipped() > 0 {
            warn!(
                "Skipped {} of {} picks ({} insufficient data, {} unavailable, {} invalid price)",
                prepared.skipped(),
                picks.len(),
                prepared.insufficient,
                prepared.unavailable,
                prepared.invalid
            );
        }
        info!(
            "Prepared {} picks with {} cached price windows",
            prepared.len(),
            self.window_cache.len()
        );
        self.status.set_skipped_picks(prepared.skipped());
        Ok(Arc::new(prepared))
    }
}
