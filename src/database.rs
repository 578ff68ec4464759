use crate::models::{KellyRecommendation, OptimizationResult, Pick, PickFilter, PriceBar};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::error;
use std::collections::HashMap;
use tokio_postgres::{Client, NoTls, Row};

/// Label stored for results computed across every algorithm.
pub const ALL_ALGORITHMS_LABEL: &str = "all";

pub struct Database {
    client: Client,
}

impl Database {
    pub async fn new<S: AsRef<str>>(database_url: S) -> Result<Self> {
        let database_url = database_url.as_ref().to_string();
        let (client, connection) = tokio_postgres::connect(&database_url, NoTls)
            .await
            .with_context(|| format!("failed to connect to PostgreSQL at {}", database_url))?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("PostgreSQL connection error: {}", err);
            }
        });

        Ok(Self { client })
    }

    pub async fn get_all_settings(&self) -> Result<HashMap<String, String>> {
        let rows = self
            .client
            .query("SELECT setting_key, value FROM settings", &[])
            .await?;
        let mut settings = HashMap::with_capacity(rows.len());
        for row in rows {
            settings.insert(row.get::<_, String>(0), row.get::<_, String>(1));
        }
        Ok(settings)
    }

    /// Daily bars for `symbols` on or after `since`, ascending by date.
    pub async fn get_bars_for_tickers(
        &self,
        symbols: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<PriceBar>> {
        if symbols.is_empty() {
            return Ok(Vec::new());
        }

        let symbols_param: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
        let since_date = since.date_naive();
        let rows = self
            .client
            .query(
                "SELECT ticker, date, open, high, low, close, volume_shares
                 FROM candles
                 WHERE ticker = ANY($1) AND date >= $2
                 ORDER BY date, ticker",
                &[&symbols_param, &since_date],
            )
            .await?;

        Ok(rows.iter().map(bar_from_row).collect())
    }

    pub async fn get_picks(&self, filter: &PickFilter) -> Result<Vec<Pick>> {
        let algorithm = filter.algorithm.as_deref();
        let since: Option<NaiveDate> = filter.lookback_days.filter(|days| *days > 0).map(|days| {
            let reference = filter.as_of.unwrap_or_else(|| Utc::now().date_naive());
            reference - Duration::days(days)
        });
        let until: Option<NaiveDate> = filter.as_of;

        let rows = self
            .client
            .query(
                "SELECT ticker, entry_date, entry_price, algorithm, score, shares
                 FROM picks
                 WHERE ($1::TEXT IS NULL OR LOWER(algorithm) = LOWER($1))
                   AND ($2::DATE IS NULL OR entry_date >= $2)
                   AND ($3::DATE IS NULL OR entry_date <= $3)
                 ORDER BY entry_date, ticker, algorithm",
                &[&algorithm, &since, &until],
            )
            .await?;

        Ok(rows.iter().map(pick_from_row).collect())
    }

    /// Writes are keyed by (algorithm, run_date); a second run on the same day replaces the first.
    pub async fn upsert_optimization_result(
        &self,
        algorithm: &str,
        run_date: NaiveDate,
        result: &OptimizationResult,
    ) -> Result<()> {
        let payload =
            serde_json::to_value(result).context("Failed to serialize optimization result")?;
        let best = result.best();
        let best_rules = best.map(|cell| serde_json::json!(cell.rules));
        let best_score = best.map(|cell| cell.score);
        let combos_tested = result.combos_tested as i32;
        let combos_total = result.combos_total as i32;

        self.client
            .execute(
                "INSERT INTO optimization_results (algorithm, run_date, run_id, objective, profitability_rate, combos_tested, combos_total, timed_out, best_rules, best_score, result, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, CURRENT_TIMESTAMP)
                 ON CONFLICT (algorithm, run_date) DO UPDATE SET
                    run_id = EXCLUDED.run_id,
                    objective = EXCLUDED.objective,
                    profitability_rate = EXCLUDED.profitability_rate,
                    combos_tested = EXCLUDED.combos_tested,
                    combos_total = EXCLUDED.combos_total,
                    timed_out = EXCLUDED.timed_out,
                    best_rules = EXCLUDED.best_rules,
                    best_score = EXCLUDED.best_score,
                    result = EXCLUDED.result,
                    created_at = CURRENT_TIMESTAMP",
                &[
                    &algorithm,
                    &run_date,
                    &result.run_id,
                    &result.objective,
                    &result.profitability_rate,
                    &combos_tested,
                    &combos_total,
                    &result.timed_out,
                    &best_rules,
                    &best_score,
                    &payload,
                ],
            )
            .await
            .with_context(|| format!("Failed to store optimization result for {}", algorithm))?;

        Ok(())
    }

    pub async fn upsert_kelly_recommendation(
        &self,
        algorithm: &str,
        run_date: NaiveDate,
        recommendation: &KellyRecommendation,
        trade_count: u32,
    ) -> Result<()> {
        let trade_count = trade_count as i32;
        self.client
            .execute(
                "INSERT INTO kelly_recommendations (algorithm, run_date, full_kelly, half_kelly, quarter_kelly, recommended, edge, payoff_ratio, trade_count, created_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, CURRENT_TIMESTAMP)
                 ON CONFLICT (algorithm, run_date) DO UPDATE SET
                    full_kelly = EXCLUDED.full_kelly,
                    half_kelly = EXCLUDED.half_kelly,
                    quarter_kelly = EXCLUDED.quarter_kelly,
                    recommended = EXCLUDED.recommended,
                    edge = EXCLUDED.edge,
                    payoff_ratio = EXCLUDED.payoff_ratio,
                    trade_count = EXCLUDED.trade_count,
                    created_at = CURRENT_TIMESTAMP",
                &[
                    &algorithm,
                    &run_date,
                    &recommendation.full,
                    &recommendation.half,
                    &recommendation.quarter,
                    &recommendation.recommended,
                    &recommendation.edge,
                    &recommendation.payoff_ratio,
                    &trade_count,
                ],
            )
            .await
            .with_context(|| format!("Failed to store Kelly recommendation for {}", algorithm))?;

        Ok(())
    }

    pub async fn get_kelly_recommendations(
        &self,
        run_date: NaiveDate,
    ) -> Result<HashMap<String, KellyRecommendation>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT ON (algorithm) algorithm, full_kelly, half_kelly, quarter_kelly, recommended, edge, payoff_ratio
                 FROM kelly_recommendations
                 WHERE run_date <= $1
                 ORDER BY algorithm, run_date DESC",
                &[&run_date],
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                (
                    row.get::<_, String>(0),
                    KellyRecommendation {
                        full: row.get(1),
                        half: row.get(2),
                        quarter: row.get(3),
                        recommended: row.get(4),
                        edge: row.get(5),
                        payoff_ratio: row.get(6),
                    },
                )
            })
            .collect())
    }
}

fn bar_from_row(row: &Row) -> PriceBar {
    let date: NaiveDate = row.get(1);
    PriceBar {
        ticker: row.get(0),
        date: naive_date_to_datetime(date),
        open: row.get(2),
        high: row.get(3),
        low: row.get(4),
        close: row.get(5),
        volume_shares: row.get(6),
    }
}

fn pick_from_row(row: &Row) -> Pick {
    let entry_date: NaiveDate = row.get(1);
    Pick {
        ticker: row.get(0),
        entry_date: naive_date_to_datetime(entry_date),
        entry_price: row.get(2),
        algorithm: row.get(3),
        score: row.get::<_, Option<f64>>(4),
        shares: row.get::<_, Option<i64>>(5),
    }
}

fn naive_date_to_datetime(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}
