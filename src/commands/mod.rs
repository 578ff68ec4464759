pub mod allocate;
pub mod export_market_data;
pub mod horizons;
pub mod market_data_snapshot;
pub mod optimize;
pub mod simulate;

use crate::context::{AppContext, EngineContext};
use crate::database::ALL_ALGORITHMS_LABEL;
use anyhow::Result;
use std::path::Path;

/// Resolves market data for a command, checking the snapshot path first when one is given.
pub(crate) async fn load_engine_context(
    app: &AppContext,
    data_file: Option<&Path>,
    algorithm: Option<String>,
) -> Result<EngineContext> {
    if let Some(path) = data_file {
        market_data_snapshot::ensure_market_data_file(path).await?;
        log::info!("Using market data snapshot from {}", path.display());
    }
    app.engine_context(data_file, algorithm).await
}

pub(crate) fn result_label(algorithm: Option<&str>) -> String {
    algorithm
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| ALL_ALGORITHMS_LABEL.to_string())
}
