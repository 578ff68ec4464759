use crate::bar_utils::normalize_ticker_symbol;
use crate::error::{EngineError, EngineResult};
use crate::models::{AllocatedPosition, Allocation, KellyRecommendation, Pick, SkippedPick};
use log::{debug, warn};
use std::collections::HashMap;

/// Spends `capital` across the highest-scoring picks, sized by the Kelly
/// fraction of each pick's algorithm.
///
/// Picks are deduplicated by ticker (highest score wins, first seen on ties)
/// and walked in score order. A pick that rounds to zero shares is skipped
/// but still uses up one of the `max_positions` slots. Positions are sized
/// from the full `capital`, so large fractions can over-commit it; that shows
/// up as a negative `cash_remaining`.
pub fn allocate(
    capital: f64,
    picks: &[Pick],
    kelly_by_algorithm: &HashMap<String, KellyRecommendation>,
    max_positions: usize,
    default_fraction: f64,
) -> EngineResult<Allocation> {
    if !capital.is_finite() || capital <= 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "capital must be a positive number (value: {})",
            capital
        )));
    }
    if !default_fraction.is_finite() || !(0.0..=1.0).contains(&default_fraction) {
        return Err(EngineError::InvalidInput(format!(
            "default Kelly fraction must be within [0, 1] (value: {})",
            default_fraction
        )));
    }

    let candidates = dedupe_by_ticker(picks);
    let mut positions = Vec::new();
    let mut skipped = Vec::new();
    let mut total_allocated = 0.0;

    for (slot, (ticker, pick)) in candidates.into_iter().enumerate() {
        if slot >= max_positions {
            break;
        }

        let kelly_fraction = kelly_by_algorithm
            .get(&pick.algorithm)
            .map(|rec| rec.recommended)
            .filter(|fraction| fraction.is_finite())
            .unwrap_or(default_fraction);
        let target_value = capital * kelly_fraction;

        let shares = if pick.entry_price.is_finite() && pick.entry_price > 0.0 {
            (target_value / pick.entry_price).floor() as i64
        } else {
            0
        };
        if shares <= 0 {
            let reason = if pick.entry_price.is_finite() && pick.entry_price > 0.0 {
                format!(
                    "position value {:.2} buys no shares at {:.2}",
                    target_value, pick.entry_price
                )
            } else {
                format!("entry price {} is not positive", pick.entry_price)
            };
            debug!("Skipping {}: {}", ticker, reason);
            skipped.push(SkippedPick {
                ticker,
                algorithm: pick.algorithm.clone(),
                reason,
            });
            continue;
        }

        let position_value = shares as f64 * pick.entry_price;
        total_allocated += position_value;
        positions.push(AllocatedPosition {
            ticker,
            algorithm: pick.algorithm.clone(),
            entry_price: pick.entry_price,
            score: pick.score_or_zero(),
            kelly_fraction,
            shares,
            position_value,
        });
    }

    if total_allocated > capital {
        warn!(
            "Allocated {:.2} exceeds capital {:.2} across {} positions",
            total_allocated,
            capital,
            positions.len()
        );
    }

    Ok(Allocation {
        capital,
        positions,
        skipped,
        total_allocated,
        cash_remaining: capital - total_allocated,
        allocation_pct: total_allocated / capital * 100.0,
    })
}

/// Keeps one pick per normalized ticker, sorted by score descending.
/// Equal scores keep first-seen order because the sort is stable.
fn dedupe_by_ticker(picks: &[Pick]) -> Vec<(String, &Pick)> {
    let mut best: Vec<(String, &Pick)> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for pick in picks {
        let Some(ticker) = normalize_ticker_symbol(&pick.ticker) else {
            continue;
        };
        match positions.get(&ticker) {
            Some(&idx) => {
                if pick.score_or_zero() > best[idx].1.score_or_zero() {
                    best[idx].1 = pick;
                }
            }
            None => {
                positions.insert(ticker.clone(), best.len());
                best.push((ticker, pick));
            }
        }
    }

    best.sort_by(|a, b| b.1.score_or_zero().total_cmp(&a.1.score_or_zero()));
    best
}
