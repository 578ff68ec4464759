use thiserror::Error;

/// Failures surfaced by the simulation core.
///
/// Degenerate arithmetic (zero average loss, certain win rates) is never an
/// error: the Kelly function floors and clamps those cases instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// Rejects a single request: bad entry price, malformed rule set or grid.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Fewer than two qualifying bars for a pick. Callers skip the pick.
    #[error("insufficient price data for {ticker}: {bars} qualifying bar(s)")]
    InsufficientData { ticker: String, bars: usize },

    /// The price provider could not serve a ticker.
    #[error("price data unavailable for {ticker}: {reason}")]
    UpstreamUnavailable { ticker: String, reason: String },
}

impl EngineError {
    /// Per-pick failures are absorbed and counted instead of aborting a batch.
    pub fn is_per_pick(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. } | EngineError::UpstreamUnavailable { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
