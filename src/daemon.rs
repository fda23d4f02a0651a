use anyhow::Result;
use chrono::{Duration, Utc};
use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;
use tokio::time::sleep;

use crate::agents::{RiskAgent, StrategyAgentConfig, run_strategy_agent};
use crate::{FetchArgs, agents, insights, ohlcv, report};

/// Everything one daemon cycle needs, resolved from CLI defaults in main.
pub struct DaemonConfig {
    pub continuous: bool,
    pub check_interval: u64,
    pub symbols: Vec<String>,
    pub data_dir: PathBuf,
    pub out_dir: PathBuf,
    pub cash: f64,
    pub commission: f64,
    pub max_loss_percent: f64,
    pub max_gain_percent: f64,
}

/// Daemon mode: collect fresh bars, re-run the strategy suite, analyze and
/// risk-check on a fixed interval.
pub async fn execute(cfg: DaemonConfig) -> Result<()> {
    println!("🚀 Starting Backtest Lab Daemon");
    println!("Data Dir: {}", cfg.data_dir.display());
    println!("Output Dir: {}", cfg.out_dir.display());
    println!("Cash per Run: ${:.0}", cfg.cash);
    println!(
        "Daily Limits: -{:.1}% / +{:.1}%",
        cfg.max_loss_percent, cfg.max_gain_percent
    );
    println!("Check Interval: {} minutes", cfg.check_interval);
    println!("Continuous Mode: {}", cfg.continuous);
    println!();

    let mut risk_agent = RiskAgent::load(
        cfg.out_dir.join("risk_state.json"),
        cfg.max_loss_percent,
        cfg.max_gain_percent,
    )?;
    let mut iteration = 0;

    loop {
        iteration += 1;
        let start_time = Utc::now();

        println!(
            "⏰ === DAEMON CYCLE #{} - {} ===",
            iteration,
            start_time.format("%Y-%m-%d %H:%M:%S UTC")
        );

        // Step 1: Fetch latest OHLCV data
        if cfg.symbols.is_empty() {
            println!("1. No symbols configured, using existing data files");
        } else {
            println!("1. Fetching latest OHLCV data...");
            match fetch_latest_data(&cfg).await {
                Ok(_) => println!("   ✅ OHLCV data updated successfully"),
                Err(e) => {
                    println!("   ❌ OHLCV data fetch failed: {e:#}");
                    if !cfg.continuous {
                        return Err(e);
                    }
                    println!(
                        "   ⏭️  Skipping this cycle, will retry in {} minutes",
                        cfg.check_interval
                    );
                    sleep(StdDuration::from_secs(cfg.check_interval * 60)).await;
                    continue;
                }
            }
        }

        // Step 2: Run the strategy suite
        println!("2. Running strategy suite...");
        let agent_cfg = StrategyAgentConfig {
            data_dir: cfg.data_dir.clone(),
            out_dir: cfg.out_dir.clone(),
            cash: cfg.cash,
            commission: cfg.commission,
        };
        let reports = match run_strategy_agent(&agent_cfg) {
            Ok(reports) => {
                println!("   ✅ {} backtests completed", reports.len());
                reports
            }
            Err(e) => {
                println!("   ❌ Strategy suite failed: {e:#}");
                if !cfg.continuous {
                    return Err(e);
                }
                println!(
                    "   ⏭️  Skipping this cycle, will retry in {} minutes",
                    cfg.check_interval
                );
                sleep(StdDuration::from_secs(cfg.check_interval * 60)).await;
                continue;
            }
        };

        // Step 3: Leaderboard over the saved reports
        println!("3. Analyzing strategy runs...");
        match report::execute(&cfg.out_dir, None) {
            Ok(_) => println!("   ✅ Strategy analysis completed successfully"),
            Err(e) => {
                println!("   ❌ Strategy analysis failed: {e:#}");
                if !cfg.continuous {
                    return Err(e);
                }
                println!(
                    "   ⏭️  Skipping this cycle, will retry in {} minutes",
                    cfg.check_interval
                );
                sleep(StdDuration::from_secs(cfg.check_interval * 60)).await;
                continue;
            }
        }

        // Step 4: Risk check against daily limits
        println!("4. Checking portfolio risk limits...");
        check_risk(&mut risk_agent, &reports)?;

        // Step 5: Portfolio and per-run commentary
        println!("5. Generating portfolio insights...");
        if let Err(e) = write_portfolio_insights(&cfg, &reports).await {
            println!("   ⚠️  Portfolio insights failed: {e:#}");
        }
        if let Err(e) = write_strategy_insights(&cfg, &reports).await {
            println!("   ⚠️  Strategy insights failed: {e:#}");
        }

        let end_time = Utc::now();
        let duration = end_time - start_time;
        println!(
            "   ✅ Cycle completed in {:.1} seconds",
            duration.num_seconds() as f64
        );

        if !cfg.continuous {
            println!("🎯 Single run completed successfully!");
            break;
        }

        let next_run = start_time + Duration::minutes(cfg.check_interval as i64);
        println!(
            "⏰ Next run scheduled for: {}",
            next_run.format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!();

        sleep(StdDuration::from_secs(cfg.check_interval * 60)).await;
    }

    Ok(())
}

async fn fetch_latest_data(cfg: &DaemonConfig) -> Result<()> {
    let fetch_args = FetchArgs {
        out: Some(cfg.data_dir.clone()),
        symbols: Some(cfg.symbols.clone()),
        days_back: Some(30),
        resume: Some(true),
        ..Default::default()
    };
    ohlcv::execute(&fetch_args).await
}

fn check_risk(
    risk_agent: &mut RiskAgent,
    reports: &[crate::backtest::BacktestReport],
) -> Result<()> {
    if reports.is_empty() {
        println!("   ⚠️  No runs to risk-check");
        return Ok(());
    }
    // the lab's portfolio marks every run at its final equity
    let equity: f64 = reports.iter().map(|r| r.equity_final).sum();
    let decision = risk_agent.check(Utc::now().naive_utc(), equity)?;
    match decision {
        agents::RiskDecision::Ok { pnl_pct } => {
            println!("   ✅ Within daily limits ({pnl_pct:+.2}% vs anchor)");
        }
        agents::RiskDecision::LimitBreached { pnl_pct } => {
            println!("   🛑 Daily limit breached ({pnl_pct:+.2}%), entries blocked");
        }
        agents::RiskDecision::EntriesBlocked => {
            println!("   🛑 Entries remain blocked until the next trading day");
        }
    }
    Ok(())
}

async fn write_portfolio_insights(
    cfg: &DaemonConfig,
    reports: &[crate::backtest::BacktestReport],
) -> Result<()> {
    if reports.is_empty() {
        return Ok(());
    }
    let profitable: Vec<_> = reports.iter().filter(|r| r.is_profitable()).collect();
    let n = profitable.len().max(1) as f64;
    let avg_return = profitable.iter().map(|r| r.return_pct).sum::<f64>() / n;
    let avg_sharpe = profitable.iter().map(|r| r.sharpe).sum::<f64>() / n;
    let avg_win_rate = profitable.iter().map(|r| r.win_rate_pct).sum::<f64>() / n;

    let mut top: Vec<(String, f64)> = reports
        .iter()
        .map(|r| (format!("{}/{}", r.strategy, r.symbol), r.return_pct))
        .collect();
    top.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

    let commentary = insights::generate_portfolio_insights(
        reports.len(),
        profitable.len(),
        avg_return,
        avg_sharpe,
        avg_win_rate,
        top,
    )
    .await?;

    let path = cfg.out_dir.join("portfolio_insights.txt");
    let stamped = format!(
        "=== PORTFOLIO INSIGHTS - {} ===\n\n{}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
        commentary
    );
    fs::write(&path, stamped)?;
    println!("   📄 Portfolio insights saved to {}", path.display());
    Ok(())
}

/// Per-run commentary for the best profitable runs of this cycle.
async fn write_strategy_insights(
    cfg: &DaemonConfig,
    reports: &[crate::backtest::BacktestReport],
) -> Result<()> {
    let mut profitable: Vec<_> = reports.iter().filter(|r| r.is_profitable()).collect();
    profitable.sort_by(|a, b| b.return_pct.partial_cmp(&a.return_pct).unwrap());

    for r in profitable.iter().take(3) {
        let summary = report::RunSummary::from(*r);
        let run_insights = match insights::generate_strategy_insights(&summary).await {
            Ok(ins) => ins,
            Err(e) => {
                println!(
                    "   ⚠️  AI insights unavailable for {}: {e:#}. Using fallback analysis.",
                    summary.strategy
                );
                insights::generate_fallback_insights(&summary)
            }
        };
        let path = cfg
            .out_dir
            .join(format!("insights_{}_{}.json", r.strategy, r.symbol));
        fs::write(&path, serde_json::to_string_pretty(&run_insights)?)?;
        println!("   📄 Strategy insights saved to {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::BacktestReport;
    use chrono::NaiveDate;

    fn saved_run(strategy: &str, ret: f64, win: f64, pf: f64) -> BacktestReport {
        let t = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        BacktestReport {
            strategy: strategy.to_string(),
            params: Vec::new(),
            symbol: "SOL".to_string(),
            start: t,
            end: t,
            bars: 100,
            exposure_pct: 40.0,
            equity_initial: 100_000.0,
            equity_final: 100_000.0 * (1.0 + ret / 100.0),
            equity_peak: 112_000.0,
            return_pct: ret,
            buy_hold_return_pct: 1.0,
            max_drawdown_pct: 5.0,
            sharpe: 1.1,
            n_trades: 12,
            win_rate_pct: win,
            profit_factor: pf,
            avg_trade_pct: 0.5,
            best_trade_pct: 2.0,
            worst_trade_pct: -1.0,
            equity_curve: Vec::new(),
            trades: Vec::new(),
        }
    }

    #[tokio::test]
    async fn profitable_runs_get_insight_files() {
        let out = tempfile::tempdir().unwrap();
        let cfg = DaemonConfig {
            continuous: false,
            check_interval: 1,
            symbols: Vec::new(),
            data_dir: out.path().to_path_buf(),
            out_dir: out.path().to_path_buf(),
            cash: 100_000.0,
            commission: 0.0,
            max_loss_percent: 2.0,
            max_gain_percent: 5.0,
        };
        let reports = vec![
            saved_run("macd_crossover", 12.0, 60.0, 1.8),
            saved_run("atr_reversion", -4.0, 40.0, 0.7),
        ];
        write_strategy_insights(&cfg, &reports).await.unwrap();
        assert!(out.path().join("insights_macd_crossover_SOL.json").exists());
        assert!(!out.path().join("insights_atr_reversion_SOL.json").exists());
    }
}
