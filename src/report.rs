//! Leaderboard over saved backtest reports. Reads the `report_*.json`
//! files a strategy-agent pass leaves behind, filters to profitable runs
//! and prints ranked tables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::backtest::BacktestReport;

/// The stats slice of a saved `BacktestReport`, enough for ranking.
/// Unknown fields in the JSON (trades, params) are ignored on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub strategy: String,
    pub symbol: String,
    pub return_pct: f64,
    pub buy_hold_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub n_trades: usize,
    pub equity_final: f64,
    pub exposure_pct: f64,
}

impl RunSummary {
    pub fn is_profitable(&self) -> bool {
        self.return_pct > 0.0 && self.win_rate_pct > 50.0 && self.profit_factor > 1.0
    }

    fn label(&self) -> String {
        format!("{}/{}", self.strategy, self.symbol)
    }
}

impl From<&BacktestReport> for RunSummary {
    fn from(r: &BacktestReport) -> Self {
        Self {
            strategy: r.strategy.clone(),
            symbol: r.symbol.clone(),
            return_pct: r.return_pct,
            buy_hold_return_pct: r.buy_hold_return_pct,
            max_drawdown_pct: r.max_drawdown_pct,
            sharpe: r.sharpe,
            win_rate_pct: r.win_rate_pct,
            profit_factor: r.profit_factor,
            n_trades: r.n_trades,
            equity_final: r.equity_final,
            exposure_pct: r.exposure_pct,
        }
    }
}

pub fn read_report_file(path: &Path) -> Result<RunSummary> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read report {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse report {}", path.display()))
}

/// Every `report_*.json` under `dir`. Unreadable files warn and are skipped.
pub fn load_reports(dir: &Path) -> Result<Vec<RunSummary>> {
    let mut summaries = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let path: PathBuf = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !path.is_file() || !name.starts_with("report_") || !name.ends_with(".json") {
            continue;
        }
        match read_report_file(&path) {
            Ok(summary) => summaries.push(summary),
            Err(e) => eprintln!("Warning: skipping {name}: {e:#}"),
        }
    }
    Ok(summaries)
}

pub fn print_leaderboard(summaries: &[RunSummary]) {
    let profitable: Vec<_> = summaries.iter().filter(|s| s.is_profitable()).collect();

    if profitable.is_empty() {
        println!("❌ No profitable strategy runs found!");
        return;
    }

    println!("🎯 PROFITABLE STRATEGY RUNS");
    println!("{}", "=".repeat(80));
    println!(
        "Found {} profitable runs out of {} total",
        profitable.len(),
        summaries.len()
    );
    println!();

    let mut sorted = profitable.clone();
    sorted.sort_by(|a, b| b.return_pct.partial_cmp(&a.return_pct).unwrap());

    println!("📈 TOP RUNS (by Return)");
    println!(
        "{:<30} {:<10} {:<10} {:<8} {:<8} {:<8} {:<8}",
        "Strategy/Symbol", "Return%", "B&H%", "WinRate%", "PF", "Sharpe", "MaxDD%"
    );
    println!("{}", "-".repeat(90));
    for s in &sorted {
        println!(
            "{:<30} {:<10.2} {:<10.2} {:<8.1} {:<8.2} {:<8.2} {:<8.2}",
            s.label(),
            s.return_pct,
            s.buy_hold_return_pct,
            s.win_rate_pct,
            s.profit_factor,
            s.sharpe,
            s.max_drawdown_pct
        );
    }
    println!();

    sorted.sort_by(|a, b| b.sharpe.partial_cmp(&a.sharpe).unwrap());

    println!("⚡ TOP RISK-ADJUSTED RUNS (by Sharpe)");
    println!(
        "{:<30} {:<8} {:<10} {:<8} {:<8} {:<8} {:<8}",
        "Strategy/Symbol", "Sharpe", "Return%", "WinRate%", "PF", "MaxDD%", "Trades"
    );
    println!("{}", "-".repeat(90));
    for s in &sorted {
        println!(
            "{:<30} {:<8.2} {:<10.2} {:<8.1} {:<8.2} {:<8.2} {:<8}",
            s.label(),
            s.sharpe,
            s.return_pct,
            s.win_rate_pct,
            s.profit_factor,
            s.max_drawdown_pct,
            s.n_trades
        );
    }
    println!();

    let n = profitable.len() as f64;
    let avg_return = profitable.iter().map(|s| s.return_pct).sum::<f64>() / n;
    let avg_win_rate = profitable.iter().map(|s| s.win_rate_pct).sum::<f64>() / n;
    let avg_sharpe = profitable.iter().map(|s| s.sharpe).sum::<f64>() / n;

    println!("📊 OVERALL STATISTICS");
    println!("   Total Runs Analyzed: {}", summaries.len());
    println!(
        "   Profitable Runs: {} ({:.1}%)",
        profitable.len(),
        n / summaries.len() as f64 * 100.0
    );
    println!("   Average Return (Profitable): {avg_return:.2}%");
    println!("   Average Win Rate (Profitable): {avg_win_rate:.1}%");
    println!("   Average Sharpe (Profitable): {avg_sharpe:.2}");
    println!();
}

pub fn print_run_detail(summaries: &[RunSummary], strategy: &str) {
    let matches: Vec<_> = summaries
        .iter()
        .filter(|s| s.strategy == strategy)
        .collect();
    if matches.is_empty() {
        println!("❌ Strategy '{strategy}' not found in saved reports");
        return;
    }
    for s in matches {
        println!("📊 {} on {}", s.strategy, s.symbol);
        println!("   Return: {:.2}%", s.return_pct);
        println!("   Buy & Hold Return: {:.2}%", s.buy_hold_return_pct);
        println!("   Exposure: {:.1}%", s.exposure_pct);
        println!("   Equity Final: ${:.2}", s.equity_final);
        println!("   Max Drawdown: {:.2}%", s.max_drawdown_pct);
        println!("   Sharpe: {:.2}", s.sharpe);
        println!("   Win Rate: {:.1}%", s.win_rate_pct);
        println!("   Profit Factor: {:.2}", s.profit_factor);
        println!("   Trades: {}", s.n_trades);
        println!();
    }
}

/// `analyze` subcommand entry point.
pub fn execute(reports_dir: &Path, detailed_strategy: Option<&str>) -> Result<()> {
    println!("🔍 Analyzing strategy reports from: {}", reports_dir.display());
    println!();

    let summaries = load_reports(reports_dir)?;
    if summaries.is_empty() {
        println!("❌ No report files found in {}", reports_dir.display());
        return Ok(());
    }

    print_leaderboard(&summaries);

    if let Some(strategy) = detailed_strategy {
        print_run_detail(&summaries, strategy);
    }

    Ok(())
}
