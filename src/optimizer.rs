use crate::aggregator::TradeTally;
use crate::cache::{PreparedPick, PreparedPicks};
use crate::config::{EngineSettings, OptimizationObjective};
use crate::error::{EngineError, EngineResult};
use crate::models::{GridCell, OptimizationResult, ParameterGrid, RankedCell};
use crate::optimizer_status::OptimizerStatus;
use crate::simulator::simulate;
use chrono::Utc;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    pub objective: OptimizationObjective,
    pub timeout: Option<Duration>,
    pub worker_threads: Option<usize>,
    pub show_progress: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        Self {
            objective: OptimizationObjective::default(),
            timeout: None,
            worker_threads: None,
            show_progress: false,
        }
    }
}

impl OptimizerOptions {
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            objective: settings.objective,
            timeout: settings.optimizer_timeout,
            ..Default::default()
        }
    }
}

struct CellOutcome {
    index: usize,
    tally: TradeTally,
    skipped: usize,
}

/// Exhaustive search over a `ParameterGrid`.
///
/// Each cell is simulated against every prepared pick on a worker thread and
/// reduced through one `TradeTally`. Outcomes are re-ordered by cell index
/// before ranking, so the ranked list does not depend on scheduling.
pub struct GridOptimizer {
    status: OptimizerStatus,
}

impl GridOptimizer {
    pub fn new(status: OptimizerStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> &OptimizerStatus {
        &self.status
    }

    pub fn optimize(
        &self,
        grid: &ParameterGrid,
        prepared: Arc<PreparedPicks>,
        options: &OptimizerOptions,
    ) -> EngineResult<OptimizationResult> {
        grid.validate()?;
        if prepared.is_empty() {
            return Err(EngineError::InvalidInput(
                "no picks with usable price data to optimize over".to_string(),
            ));
        }

        let cells = grid.cells();
        let total = cells.len();
        let started = Instant::now();
        let deadline = options.timeout.map(|timeout| started + timeout);

        let num_workers = options
            .worker_threads
            .unwrap_or_else(num_cpus::get)
            .max(1)
            .min(total);
        info!(
            "Evaluating {} grid cells against {} picks on {} worker threads (objective: {})",
            total,
            prepared.len(),
            num_workers,
            options.objective.label()
        );
        self.status.set_phase("Evaluating parameter grid");
        self.status.clear_debug_note();
        self.status.set_progress(total, 0, None);
        self.status.set_skipped_picks(prepared.skipped());

        let (tx, rx): (Sender<GridCell>, Receiver<GridCell>) = bounded(total);
        let (result_tx, result_rx): (Sender<CellOutcome>, Receiver<CellOutcome>) = bounded(total);
        let cancelled = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::with_capacity(num_workers);
        for _worker_id in 0..num_workers {
            let rx = rx.clone();
            let result_tx = result_tx.clone();
            let prepared = Arc::clone(&prepared);
            let cancelled = Arc::clone(&cancelled);

            let handle = thread::spawn(move || {
                while let Ok(cell) = rx.recv() {
                    if cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    let outcome = evaluate_cell(&cell, &prepared.picks);
                    debug!(
                        "Cell {} [{}]: {} trades, {} skipped",
                        cell.index,
                        cell.rules.label(),
                        outcome.tally.trade_count,
                        outcome.skipped
                    );
                    if result_tx.send(outcome).is_err() {
                        break;
                    }
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for cell in cells {
            if tx.send(cell).is_err() {
                warn!("Optimizer task queue closed before all cells were dispatched");
                break;
            }
        }
        drop(tx);

        let pb = if options.show_progress {
            ProgressBar::new(total as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut outcomes: Vec<CellOutcome> = Vec::with_capacity(total);
        let mut best_score: Option<f64> = None;
        let mut timed_out = false;

        while outcomes.len() < total {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        break;
                    }
                    RESULT_POLL_INTERVAL.min(deadline - now)
                }
                None => RESULT_POLL_INTERVAL,
            };

            match result_rx.recv_timeout(wait) {
                Ok(outcome) => {
                    if outcome.tally.trade_count > 0 {
                        let score = options.objective.score(&outcome.tally.finish());
                        best_score = Some(best_score.map_or(score, |best| best.max(score)));
                    }
                    outcomes.push(outcome);
                    pb.set_position(outcomes.len() as u64);
                    self.status.set_progress(total, outcomes.len(), best_score);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Result channel closed unexpectedly. Some cells may be missing.");
                    break;
                }
            }
        }

        if timed_out {
            cancelled.store(true, Ordering::Relaxed);
            warn!(
                "Optimizer timed out after {:.1}s with {}/{} cells evaluated; returning partial results",
                started.elapsed().as_secs_f64(),
                outcomes.len(),
                total
            );
            self.status.set_debug_note(format!(
                "Timed out with {}/{} cells evaluated",
                outcomes.len(),
                total
            ));
            pb.abandon_with_message("Timed out");
        } else {
            pb.finish_with_message("Grid evaluated");
        }

        for handle in handles {
            if handle.join().is_err() {
                warn!("An optimizer worker thread panicked");
            }
        }

        outcomes.sort_by_key(|outcome| outcome.index);
        let combos_tested = outcomes.len();
        let ranked = rank_outcomes(&outcomes, grid, options.objective);
        let profitability_rate = profitability_rate(&ranked);

        self.status.set_phase(if timed_out {
            "Timed out"
        } else {
            "Completed"
        });
        info!(
            "Grid search finished in {:.2}s: {} ranked of {} tested, {:.1}% profitable",
            started.elapsed().as_secs_f64(),
            ranked.len(),
            combos_tested,
            profitability_rate
        );

        Ok(OptimizationResult {
            run_id: Uuid::new_v4().to_string(),
            objective: options.objective.label().to_string(),
            ranked,
            profitability_rate,
            combos_tested,
            combos_total: total,
            picks_evaluated: prepared.len(),
            picks_skipped: prepared.insufficient + prepared.invalid,
            picks_unavailable: prepared.unavailable,
            timed_out,
            generated_at: Utc::now(),
        })
    }
}

fn evaluate_cell(cell: &GridCell, picks: &[PreparedPick]) -> CellOutcome {
    let mut tally = TradeTally::new();
    let mut skipped = 0;
    for prepared in picks {
        match simulate(&prepared.pick, &prepared.window, &cell.rules) {
            Ok(trade) => tally.push(&trade),
            Err(_) => skipped += 1,
        }
    }
    CellOutcome {
        index: cell.index,
        tally,
        skipped,
    }
}

/// Orders cells by score descending, first-enumerated wins ties. Cells without
/// trades are left out.
fn rank_outcomes(
    outcomes: &[CellOutcome],
    grid: &ParameterGrid,
    objective: OptimizationObjective,
) -> Vec<RankedCell> {
    let cells = grid.cells();
    let mut ranked: Vec<RankedCell> = outcomes
        .iter()
        .filter(|outcome| outcome.tally.trade_count > 0)
        .filter_map(|outcome| {
            let cell = cells.get(outcome.index)?;
            let stats = outcome.tally.finish();
            Some(RankedCell {
                grid_index: outcome.index,
                rules: cell.rules,
                score: objective.score(&stats),
                stats,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.grid_index.cmp(&b.grid_index))
    });
    ranked
}

fn profitability_rate(ranked: &[RankedCell]) -> f64 {
    if ranked.is_empty() {
        return 0.0;
    }
    let profitable = ranked
        .iter()
        .filter(|cell| cell.stats.avg_return_pct > 0.0)
        .count();
    profitable as f64 / ranked.len() as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Pick, PriceBar};
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    fn prepared_pick(ticker: &str, closes: &[f64]) -> PreparedPick {
        let window: Vec<PriceBar> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| PriceBar {
                ticker: ticker.to_string(),
                date: base() + ChronoDuration::days(i as i64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume_shares: 1_000,
            })
            .collect();
        PreparedPick {
            pick: Pick {
                ticker: ticker.to_string(),
                entry_date: base(),
                entry_price: closes[0],
                algorithm: "alpha".to_string(),
                score: None,
                shares: None,
            },
            window: Arc::new(window),
        }
    }

    fn prepared(picks: Vec<PreparedPick>) -> Arc<PreparedPicks> {
        Arc::new(PreparedPicks {
            picks,
            ..Default::default()
        })
    }

    fn small_grid() -> ParameterGrid {
        ParameterGrid {
            take_profit_pcts: vec![3.0, 6.0, 999.0],
            stop_loss_pcts: vec![2.0, 999.0],
            max_hold_days: vec![2, 5],
            slippage_pct: None,
            commission: None,
        }
    }

    fn rising() -> Vec<f64> {
        (0..10).map(|d| 100.0 + d as f64).collect()
    }

    #[test]
    fn every_cell_is_tested_and_ranked() {
        let optimizer = GridOptimizer::new(OptimizerStatus::new());
        let result = optimizer
            .optimize(
                &small_grid(),
                prepared(vec![prepared_pick("AAA", &rising())]),
                &OptimizerOptions::default(),
            )
            .unwrap();

        assert_eq!(result.combos_total, 12);
        assert_eq!(result.combos_tested, 12);
        assert_eq!(result.ranked.len(), 12);
        assert!(!result.timed_out);
        assert!(result
            .ranked
            .windows(2)
            .all(|pair| pair[0].score >= pair[1].score));
        assert_eq!(result.profitability_rate, 100.0);
        assert_eq!(optimizer.status().snapshot().completed_cells, 12);
    }

    #[test]
    fn skipped_and_unavailable_picks_reach_the_result() {
        let picks = Arc::new(PreparedPicks {
            picks: vec![prepared_pick("AAA", &rising())],
            insufficient: 2,
            unavailable: 3,
            invalid: 1,
        });
        let result = GridOptimizer::new(OptimizerStatus::new())
            .optimize(&small_grid(), picks, &OptimizerOptions::default())
            .unwrap();

        assert_eq!(result.picks_evaluated, 1);
        assert_eq!(result.picks_skipped, 3);
        assert_eq!(result.picks_unavailable, 3);
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let grid = ParameterGrid {
            take_profit_pcts: vec![50.0, 60.0],
            stop_loss_pcts: vec![999.0],
            max_hold_days: vec![1],
            slippage_pct: None,
            commission: None,
        };
        let result = GridOptimizer::new(OptimizerStatus::new())
            .optimize(
                &grid,
                prepared(vec![prepared_pick("AAA", &rising())]),
                &OptimizerOptions::default(),
            )
            .unwrap();

        assert_eq!(result.ranked[0].score, result.ranked[1].score);
        assert_eq!(result.ranked[0].grid_index, 0);
        assert_eq!(result.ranked[1].grid_index, 1);
    }

    #[test]
    fn results_do_not_depend_on_worker_count() {
        let picks = prepared(vec![
            prepared_pick("AAA", &rising()),
            prepared_pick("BBB", &[50.0, 49.0, 51.5, 47.0, 53.0, 52.0, 48.0]),
            prepared_pick("CCC", &[20.0, 20.4, 19.7, 21.0, 22.5]),
        ]);
        let optimizer = GridOptimizer::new(OptimizerStatus::new());
        let single = optimizer
            .optimize(
                &small_grid(),
                Arc::clone(&picks),
                &OptimizerOptions {
                    worker_threads: Some(1),
                    ..Default::default()
                },
            )
            .unwrap();
        let many = optimizer
            .optimize(
                &small_grid(),
                picks,
                &OptimizerOptions {
                    worker_threads: Some(8),
                    ..Default::default()
                },
            )
            .unwrap();

        let order = |r: &OptimizationResult| -> Vec<usize> {
            r.ranked.iter().map(|cell| cell.grid_index).collect()
        };
        assert_eq!(order(&single), order(&many));
        assert_eq!(single.profitability_rate, many.profitability_rate);
        for (a, b) in single.ranked.iter().zip(&many.ranked) {
            assert_eq!(a.stats, b.stats);
        }
    }

    #[test]
    fn cells_without_trades_are_counted_but_not_ranked() {
        let result = GridOptimizer::new(OptimizerStatus::new())
            .optimize(
                &small_grid(),
                prepared(vec![prepared_pick("AAA", &[100.0])]),
                &OptimizerOptions::default(),
            )
            .unwrap();

        assert_eq!(result.combos_tested, 12);
        assert!(result.ranked.is_empty());
        assert_eq!(result.profitability_rate, 0.0);
        assert!(result.best().is_none());
    }

    #[test]
    fn zero_timeout_returns_partial_result() {
        let result = GridOptimizer::new(OptimizerStatus::new())
            .optimize(
                &ParameterGrid::default(),
                prepared(vec![prepared_pick("AAA", &rising())]),
                &OptimizerOptions {
                    timeout: Some(Duration::ZERO),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(result.timed_out);
        assert!(result.combos_tested < result.combos_total);
        assert!(result.ranked.len() <= result.combos_tested);
    }

    #[test]
    fn rejects_empty_requests() {
        let optimizer = GridOptimizer::new(OptimizerStatus::new());
        let err = optimizer
            .optimize(&small_grid(), prepared(Vec::new()), &OptimizerOptions::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let empty_grid = ParameterGrid {
            take_profit_pcts: Vec::new(),
            ..small_grid()
        };
        let err = optimizer
            .optimize(
                &empty_grid,
                prepared(vec![prepared_pick("AAA", &rising())]),
                &OptimizerOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn top_and_bottom_share_one_ranking() {
        let result = GridOptimizer::new(OptimizerStatus::new())
            .optimize(
                &small_grid(),
                prepared(vec![
                    prepared_pick("AAA", &rising()),
                    prepared_pick("BBB", &[50.0, 49.0, 51.5, 47.0, 53.0, 52.0, 48.0]),
                ]),
                &OptimizerOptions::default(),
            )
            .unwrap();

        let top = result.top(3);
        let bottom = result.bottom(3);
        assert_eq!(top.len(), 3);
        assert_eq!(
            bottom[0].grid_index,
            result.ranked[result.ranked.len() - 1].grid_index
        );
        assert_eq!(result.top(100).len(), result.ranked.len());
    }
}
