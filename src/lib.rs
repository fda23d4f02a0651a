pub mod agents;
pub mod backtest;
pub mod daemon;
pub mod indicators;
pub mod insights;
pub mod ohlcv;
pub mod optimize;
pub mod report;
pub mod strategies;

use clap::Parser;
use std::path::PathBuf;

/// CLI args
#[derive(Parser, Debug, Clone, Default)]
#[command(
    version,
    about = "OHLCV CSV collector with resume, bounded concurrency and a single-instance lock"
)]
pub struct FetchArgs {
    /// Output directory for CSVs
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Birdeye API key (or set BIRDEYE_API_KEY env)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Token symbols/addresses to collect
    #[arg(long, num_args = 1..)]
    pub symbols: Option<Vec<String>>,

    /// How many days of history to request
    #[arg(long)]
    pub days_back: Option<u32>,

    /// Bar interval: 15m, 1h, 4h, 1d, 1w
    #[arg(long)]
    pub timeframe: Option<String>,

    /// Concurrency for OHLCV fetches (be mindful of plan limits)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Delay (ms) between requests to avoid bursts
    #[arg(long)]
    pub request_delay_ms: Option<u64>,

    /// Resume mode: append only bars newer than the last CSV timestamp
    #[arg(long)]
    pub resume: Option<bool>,

    /// Optional lock file path to prevent concurrent runs
    #[arg(long)]
    pub lock_file: Option<PathBuf>,
}

/// Runs one strategy over an OHLCV CSV and prints the stats block.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct BacktestArgs {
    /// Path to the OHLCV CSV
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Registered strategy name (omit to list)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Starting cash
    #[arg(long)]
    pub cash: Option<f64>,

    /// Fractional commission per fill (0.002 = 0.2%)
    #[arg(long)]
    pub commission: Option<f64>,

    /// An entry closes any prior position first
    #[arg(long)]
    pub exclusive_orders: Option<bool>,

    /// Output directory for equity/trade CSVs and the report JSON
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Grid-sweeps a strategy's parameters and reports the best run.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct OptimizeArgs {
    /// Path to the OHLCV CSV
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Registered strategy name (must have a parameter grid)
    #[arg(long)]
    pub strategy: Option<String>,

    /// Starting cash
    #[arg(long)]
    pub cash: Option<f64>,

    /// Fractional commission per fill
    #[arg(long)]
    pub commission: Option<f64>,

    /// Stat to maximize: equity_final, return_pct, sharpe
    #[arg(long)]
    pub maximize: Option<String>,

    /// Output directory for the sweep CSV and best-run report
    #[arg(long)]
    pub out: Option<PathBuf>,
}

/// Ranks saved backtest reports into a leaderboard.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct AnalyzeArgs {
    /// Directory containing report_*.json files
    #[arg(long)]
    pub reports: Option<PathBuf>,

    /// Print the full stats block for one strategy
    #[arg(long)]
    pub detailed: Option<String>,
}

/// Continuous collect/backtest/analyze/risk-check loop.
#[derive(Parser, Debug, Clone, Default)]
#[command(version, about)]
pub struct DaemonArgs {
    /// Keep looping; otherwise run one cycle and exit (cron/systemd friendly)
    #[arg(long)]
    pub continuous: Option<bool>,

    /// Minutes between cycles in continuous mode
    #[arg(long)]
    pub check_interval: Option<u64>,

    /// Symbols to refresh each cycle (omit to reuse existing data files)
    #[arg(long, num_args = 0..)]
    pub symbols: Option<Vec<String>>,

    /// Directory of OHLCV CSVs
    #[arg(long)]
    pub data: Option<PathBuf>,

    /// Output directory for reports and state
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Starting cash per backtest run
    #[arg(long)]
    pub cash: Option<f64>,

    /// Fractional commission per fill
    #[arg(long)]
    pub commission: Option<f64>,

    /// Daily max loss vs the day's anchor equity, percent
    #[arg(long)]
    pub max_loss_percent: Option<f64>,

    /// Daily max gain vs the day's anchor equity, percent
    #[arg(long)]
    pub max_gain_percent: Option<f64>,
}
