//! Grid parameter sweeps. Runs the cartesian product of a strategy's
//! parameter grid through the engine, keeps the best run by the chosen
//! stat, and can dump the whole sweep table as CSV.

use anyhow::{Context, Result, bail};
use csv::WriterBuilder;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::backtest::{Backtest, BacktestReport};
use crate::ohlcv::Series;
use crate::strategies;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    EquityFinal,
    #[default]
    ReturnPct,
    Sharpe,
}

impl Metric {
    fn of(&self, report: &BacktestReport) -> f64 {
        match self {
            Metric::EquityFinal => report.equity_final,
            Metric::ReturnPct => report.return_pct,
            Metric::Sharpe => report.sharpe,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Metric::EquityFinal => "equity_final",
            Metric::ReturnPct => "return_pct",
            Metric::Sharpe => "sharpe",
        };
        f.write_str(s)
    }
}

impl FromStr for Metric {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "equity_final" | "equity" => Ok(Metric::EquityFinal),
            "return_pct" | "return" => Ok(Metric::ReturnPct),
            "sharpe" => Ok(Metric::Sharpe),
            other => bail!("unknown metric '{other}' (equity_final, return_pct, sharpe)"),
        }
    }
}

/// One row of the sweep table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepRow {
    pub params: Vec<(String, f64)>,
    pub equity_final: f64,
    pub return_pct: f64,
    pub sharpe: f64,
    pub max_drawdown_pct: f64,
    pub win_rate_pct: f64,
    pub n_trades: usize,
}

pub struct SweepResult {
    pub best: BacktestReport,
    pub rows: Vec<SweepRow>,
}

/// Every parameter combination from the strategy's grid, constraint
/// applied. An empty or fully-filtered grid is an error.
fn combinations(name: &str) -> Result<Vec<HashMap<String, f64>>> {
    let grid = strategies::grid(name)?;
    if grid.axes.is_empty() || grid.axes.iter().any(|(_, vals)| vals.is_empty()) {
        bail!("empty parameter grid for '{name}'");
    }
    let keys: Vec<&str> = grid.axes.iter().map(|(k, _)| *k).collect();
    let combos: Vec<HashMap<String, f64>> = grid
        .axes
        .iter()
        .map(|(_, vals)| vals.iter().copied())
        .multi_cartesian_product()
        .map(|values| {
            keys.iter()
                .map(|k| k.to_string())
                .zip(values)
                .collect::<HashMap<String, f64>>()
        })
        .filter(|combo| grid.constraint.is_none_or(|c| c(combo)))
        .collect();
    if combos.is_empty() {
        bail!("every combination in the '{name}' grid failed its constraint");
    }
    Ok(combos)
}

pub fn sweep(
    series: &Series,
    name: &str,
    cash: f64,
    commission: f64,
    metric: Metric,
) -> Result<SweepResult> {
    let combos = combinations(name)?;
    info!(
        strategy = name,
        combinations = combos.len(),
        %metric,
        "starting parameter sweep"
    );

    let mut best: Option<BacktestReport> = None;
    let mut rows = Vec::with_capacity(combos.len());

    for combo in &combos {
        let mut strat = strategies::make(name, combo)?;
        let report = Backtest::new(series, cash, commission)
            .run(strat.as_mut())
            .with_context(|| format!("sweep run failed for '{name}'"))?;
        rows.push(SweepRow {
            params: report.params.clone(),
            equity_final: report.equity_final,
            return_pct: report.return_pct,
            sharpe: report.sharpe,
            max_drawdown_pct: report.max_drawdown_pct,
            win_rate_pct: report.win_rate_pct,
            n_trades: report.n_trades,
        });
        let better = best
            .as_ref()
            .is_none_or(|b| metric.of(&report) > metric.of(b));
        if better {
            best = Some(report);
        }
    }

    // combos is non-empty, so best is set
    let best = best.context("no sweep runs completed")?;
    info!(
        strategy = name,
        best_metric = metric.of(&best),
        trades = best.n_trades,
        "sweep complete"
    );
    Ok(SweepResult { best, rows })
}

/// Persist the full sweep table, one row per combination.
pub fn write_sweep_csv(rows: &[SweepRow], path: &Path) -> Result<()> {
    let Some(first) = rows.first() else {
        bail!("no sweep rows to write");
    };
    fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).ok();
    let mut wtr = WriterBuilder::new().from_path(path)?;

    let mut header: Vec<String> = first.params.iter().map(|(k, _)| k.clone()).collect();
    header.extend(
        [
            "equity_final",
            "return_pct",
            "sharpe",
            "max_drawdown_pct",
            "win_rate_pct",
            "n_trades",
        ]
        .map(String::from),
    );
    wtr.write_record(&header)?;

    for row in rows {
        let mut rec: Vec<String> = row.params.iter().map(|(_, v)| v.to_string()).collect();
        rec.push(format!("{:.4}", row.equity_final));
        rec.push(format!("{:.4}", row.return_pct));
        rec.push(format!("{:.4}", row.sharpe));
        rec.push(format!("{:.4}", row.max_drawdown_pct));
        rec.push(format!("{:.4}", row.win_rate_pct));
        rec.push(row.n_trades.to_string());
        wtr.write_record(&rec)?;
    }
    wtr.flush()?;
    Ok(())
}
