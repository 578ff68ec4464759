use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::info;
use pick_engine::{
    commands::{
        allocate::{self, AllocateArgs},
        export_market_data, horizons,
        optimize::{self, OptimizeArgs},
        simulate::{self, SimulateArgs},
    },
    context::AppContext,
};
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "../data/market-data.bin";

#[derive(Parser)]
#[command(name = "engine")]
#[command(about = "Back-tests trading picks, searches exit rules and sizes positions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the take-profit / stop-loss / max-hold grid for the best exit rules
    Optimize {
        /// Only use picks from this algorithm
        #[arg(long)]
        algorithm: Option<String>,
        /// Path to the market data snapshot file (database is used when omitted)
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Number of best and worst cells to report (max 100)
        #[arg(long)]
        top: Option<usize>,
        /// Stop the scan after this many seconds and report partial results
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        /// Worker threads (defaults to the number of logical CPUs)
        #[arg(long)]
        threads: Option<usize>,
        /// Store the result in the database
        #[arg(long)]
        persist: bool,
    },
    /// Simulate every pick with a single exit rule set and report stats plus Kelly sizing
    Simulate {
        #[arg(long = "take-profit")]
        take_profit: f64,
        #[arg(long = "stop-loss")]
        stop_loss: f64,
        #[arg(long = "max-hold")]
        max_hold: u32,
        #[arg(long)]
        algorithm: Option<String>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Store per-algorithm Kelly recommendations in the database
        #[arg(long)]
        persist: bool,
    },
    /// Fixed-horizon backtests (exit at the close N bars after entry)
    Horizons {
        #[arg(long)]
        algorithm: Option<String>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Comma separated holding periods in bars
        #[arg(long, value_delimiter = ',', num_args = 1..)]
        days: Vec<u32>,
    },
    /// Spend a capital budget across the current picks using Kelly fractions
    Allocate {
        #[arg(long)]
        capital: f64,
        #[arg(long = "max-positions")]
        max_positions: Option<usize>,
        /// Derive Kelly fractions from a backtest with these rules instead of stored values
        #[arg(long = "take-profit")]
        take_profit: Option<f64>,
        #[arg(long = "stop-loss")]
        stop_loss: Option<f64>,
        #[arg(long = "max-hold")]
        max_hold: Option<u32>,
        #[arg(long)]
        algorithm: Option<String>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
    },
    /// Export a market data snapshot for offline runs
    ExportMarketData {
        /// Destination file for the snapshot
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Only export picks from this algorithm
        #[arg(long)]
        algorithm: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let database_url = env::var("DATABASE_URL").ok();
    if database_url.is_none() && command_requires_database(&command) {
        return Err(anyhow!(
            "DATABASE_URL must be set for this command. For offline runs, pass --data-file with a market data snapshot."
        ));
    }
    let app_context = AppContext::initialize(database_url).await?;

    info!("Starting engine. Not financial advice. Past performance does not predict future results.");

    match command {
        Commands::Optimize {
            algorithm,
            data_file,
            top,
            timeout_secs,
            threads,
            persist,
        } => {
            optimize::run(
                &app_context,
                OptimizeArgs {
                    algorithm,
                    data_file,
                    top,
                    timeout_secs,
                    threads,
                    persist,
                },
            )
            .await
        }
        Commands::Simulate {
            take_profit,
            stop_loss,
            max_hold,
            algorithm,
            data_file,
            persist,
        } => {
            simulate::run(
                &app_context,
                SimulateArgs {
                    take_profit,
                    stop_loss,
                    max_hold,
                    algorithm,
                    data_file,
                    persist,
                },
            )
            .await
        }
        Commands::Horizons {
            algorithm,
            data_file,
            days,
        } => horizons::run(&app_context, algorithm, data_file, days).await,
        Commands::Allocate {
            capital,
            max_positions,
            take_profit,
            stop_loss,
            max_hold,
            algorithm,
            data_file,
        } => {
            allocate::run(
                &app_context,
                AllocateArgs {
                    capital,
                    max_positions,
                    take_profit,
                    stop_loss,
                    max_hold,
                    algorithm,
                    data_file,
                },
            )
            .await
        }
        Commands::ExportMarketData { output, algorithm } => {
            let output_path = resolve_market_data_path(output);
            export_market_data::run(&app_context, &output_path, algorithm).await
        }
    }
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli_value {
        return path;
    }

    PathBuf::from(DEFAULT_MARKET_DATA_FILE)
}

fn command_requires_database(command: &Commands) -> bool {
    match command {
        Commands::Optimize { data_file, .. }
        | Commands::Simulate { data_file, .. }
        | Commands::Horizons { data_file, .. }
        | Commands::Allocate { data_file, .. } => data_file.is_none(),
        Commands::ExportMarketData { .. } => true,
    }
}
