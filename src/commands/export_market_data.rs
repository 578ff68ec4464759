use crate::config::EngineSettings;
use crate::context::AppContext;
use crate::data_context::MarketData;
use crate::models::PickFilter;
use anyhow::Result;
use log::info;
use std::path::Path;

pub async fn run(app: &AppContext, output_path: &Path, algorithm: Option<String>) -> Result<()> {
    info!(
        "Generating market data snapshot at {}",
        output_path.display()
    );

    let db = app.database().await?;
    let settings = EngineSettings::from_settings_map(&db.get_all_settings().await?)?;
    let filter = PickFilter {
        algorithm,
        lookback_days: settings.pick_lookback_days,
        as_of: None,
    };
    let market_data = MarketData::load(&db, &filter).await?;

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} picks and {} tickers written to {}",
        market_data.all_picks().len(),
        market_data.tickers().len(),
        output_path.display()
    );

    Ok(())
}
