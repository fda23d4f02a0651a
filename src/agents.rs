//! Agents driven by the daemon loop: the strategy agent runs every
//! registered strategy over every data file and persists reports; the risk
//! agent tracks portfolio equity against daily loss/gain limits.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

use crate::backtest::{Backtest, BacktestReport};
use crate::ohlcv;
use crate::strategies;

pub struct StrategyAgentConfig {
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub cash: f64,
    pub commission: f64,
}

/// Run every registered strategy over every CSV in the data directory.
/// A failing strategy/symbol pair is logged and skipped; the pass carries on.
pub fn run_strategy_agent(cfg: &StrategyAgentConfig) -> Result<Vec<BacktestReport>> {
    fs::create_dir_all(&cfg.out_dir)
        .with_context(|| format!("failed to create {}", cfg.out_dir.display()))?;

    let mut csvs: Vec<PathBuf> = fs::read_dir(&cfg.data_dir)
        .with_context(|| format!("failed to list {}", cfg.data_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "csv"))
        .collect();
    csvs.sort();

    if csvs.is_empty() {
        warn!(dir = %cfg.data_dir.display(), "no data files found");
        return Ok(Vec::new());
    }

    let mut reports = Vec::new();
    for path in &csvs {
        let series = match ohlcv::read_series(path) {
            Ok(s) => s,
            Err(e) => {
                error!(file = %path.display(), "failed to load data: {e:#}");
                continue;
            }
        };
        info!(symbol = %series.symbol, bars = series.len(), "running strategy suite");

        for name in strategies::all_strategy_names() {
            let report = strategies::make(name, &HashMap::new())
                .and_then(|mut s| Backtest::new(&series, cfg.cash, cfg.commission).run(s.as_mut()));
            match report {
                Ok(report) => {
                    if let Err(e) = persist_report(&cfg.out_dir, &report) {
                        error!(strategy = name, "failed to persist report: {e:#}");
                    }
                    reports.push(report);
                }
                Err(e) => {
                    error!(strategy = name, symbol = %series.symbol, "backtest failed: {e:#}");
                }
            }
        }
    }

    let profitable = reports.iter().filter(|r| r.is_profitable()).count();
    println!(
        "✅ Strategy agent: {} runs complete, {} profitable",
        reports.len(),
        profitable
    );
    Ok(reports)
}

fn persist_report(out_dir: &Path, report: &BacktestReport) -> Result<()> {
    let stem = format!("{}_{}", report.strategy, report.symbol);
    let json = serde_json::to_string_pretty(report)?;
    write_atomic(&out_dir.join(format!("report_{stem}.json")), json.as_bytes())?;
    report.write_equity_csv(&out_dir.join(format!("equity_{stem}.csv")))?;
    report.write_trades_csv(&out_dir.join(format!("trades_{stem}.csv")))?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskDecision {
    /// Inside limits, trading allowed.
    Ok { pnl_pct: f64 },
    /// A limit was crossed on this check; entries are now blocked.
    LimitBreached { pnl_pct: f64 },
    /// A limit was crossed earlier today; entries stay blocked.
    EntriesBlocked,
}

impl RiskDecision {
    pub fn allows_entries(&self) -> bool {
        matches!(self, RiskDecision::Ok { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RiskState {
    anchor_date: NaiveDate,
    anchor_equity: f64,
    halted: bool,
}

/// Daily-anchored portfolio limits. PnL is measured against the equity
/// recorded at the first check of each day, never against the previous
/// tick; a breach halts entries until the next day.
pub struct RiskAgent {
    max_loss_pct: f64,
    max_gain_pct: f64,
    state_path: PathBuf,
    state: Option<RiskState>,
}

impl RiskAgent {
    pub fn load(state_path: PathBuf, max_loss_pct: f64, max_gain_pct: f64) -> Result<Self> {
        let state = match fs::read_to_string(&state_path) {
            Ok(raw) => Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt risk state {}", state_path.display()))?,
            ),
            Err(_) => None,
        };
        Ok(Self {
            max_loss_pct,
            max_gain_pct,
            state_path,
            state,
        })
    }

    pub fn check(&mut self, now: NaiveDateTime, equity: f64) -> Result<RiskDecision> {
        let today = now.date();
        let state = match &mut self.state {
            Some(s) if s.anchor_date == today => s,
            _ => {
                self.state = Some(RiskState {
                    anchor_date: today,
                    anchor_equity: equity,
                    halted: false,
                });
                self.persist()?;
                info!(anchor = equity, date = %today, "risk anchor reset");
                return Ok(RiskDecision::Ok { pnl_pct: 0.0 });
            }
        };

        if state.halted {
            return Ok(RiskDecision::EntriesBlocked);
        }

        let pnl_pct = if state.anchor_equity.abs() > f64::EPSILON {
            (equity - state.anchor_equity) / state.anchor_equity * 100.0
        } else {
            0.0
        };

        if pnl_pct <= -self.max_loss_pct || pnl_pct >= self.max_gain_pct {
            state.halted = true;
            self.persist()?;
            warn!(pnl_pct, "daily limit breached, entries blocked until tomorrow");
            println!("🛑 Risk limit hit ({pnl_pct:.2}% vs daily anchor) - entries blocked");
            return Ok(RiskDecision::LimitBreached { pnl_pct });
        }

        Ok(RiskDecision::Ok { pnl_pct })
    }

    fn persist(&self) -> Result<()> {
        if let Some(state) = &self.state {
            let json = serde_json::to_string_pretty(state)?;
            if let Some(dir) = self.state_path.parent() {
                fs::create_dir_all(dir).ok();
            }
            write_atomic(&self.state_path, json.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ohlcv::{Bar, Series, write_series};
    use chrono::{Duration, NaiveDate};

    fn fixture_series(symbol: &str, n: usize) -> Series {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let bars = (0..n)
            .map(|i| {
                let c = 100.0 + 5.0 * ((i as f64 / 25.0) * std::f64::consts::TAU).sin();
                Bar {
                    time: t0 + Duration::hours(i as i64),
                    open: c,
                    high: c + 0.5,
                    low: c - 0.5,
                    close: c,
                    volume: 10.0,
                }
            })
            .collect();
        Series::new(symbol, bars)
    }

    #[test]
    fn agent_writes_reports_for_every_strategy() {
        let data_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let series = fixture_series("SOL", 400);
        write_series(&data_dir.path().join("SOL.csv"), &series).unwrap();

        let cfg = StrategyAgentConfig {
            data_dir: data_dir.path().to_path_buf(),
            out_dir: out_dir.path().to_path_buf(),
            cash: 100_000.0,
            commission: 0.001,
        };
        let reports = run_strategy_agent(&cfg).unwrap();
        assert_eq!(reports.len(), strategies::all_strategy_names().len());

        for name in strategies::all_strategy_names() {
            let json = out_dir.path().join(format!("report_{name}_SOL.json"));
            assert!(json.exists(), "missing {}", json.display());
        }
    }

    #[test]
    fn empty_data_dir_is_not_fatal() {
        let data_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let cfg = StrategyAgentConfig {
            data_dir: data_dir.path().to_path_buf(),
            out_dir: out_dir.path().to_path_buf(),
            cash: 10_000.0,
            commission: 0.0,
        };
        let reports = run_strategy_agent(&cfg).unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn risk_agent_anchors_per_day_and_halts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("risk_state.json");
        let mut agent = RiskAgent::load(path.clone(), 2.0, 5.0).unwrap();

        let day1 = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(
            agent.check(day1, 100_000.0).unwrap(),
            RiskDecision::Ok { pnl_pct: 0.0 }
        );
        // small dip stays inside limits
        assert!(
            agent
                .check(day1 + Duration::hours(1), 99_000.0)
                .unwrap()
                .allows_entries()
        );
        // 3% loss vs the ANCHOR (not vs the previous tick) breaches 2%
        let breach = agent.check(day1 + Duration::hours(2), 97_000.0).unwrap();
        assert!(matches!(breach, RiskDecision::LimitBreached { .. }));
        assert_eq!(
            agent.check(day1 + Duration::hours(3), 99_500.0).unwrap(),
            RiskDecision::EntriesBlocked
        );

        // next day resets the anchor and unblocks
        let day2 = day1 + Duration::days(1);
        assert_eq!(
            agent.check(day2, 97_000.0).unwrap(),
            RiskDecision::Ok { pnl_pct: 0.0 }
        );

        // state survives a reload
        let mut reloaded = RiskAgent::load(path, 2.0, 5.0).unwrap();
        assert!(
            reloaded
                .check(day2 + Duration::hours(1), 97_500.0)
                .unwrap()
                .allows_entries()
        );
    }

    #[test]
    fn gain_limit_also_halts() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent =
            RiskAgent::load(dir.path().join("state.json"), 2.0, 5.0).unwrap();
        let t = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        agent.check(t, 100_000.0).unwrap();
        let up = agent.check(t + Duration::hours(1), 106_000.0).unwrap();
        assert!(matches!(up, RiskDecision::LimitBreached { pnl_pct } if pnl_pct > 5.0));
    }
}
