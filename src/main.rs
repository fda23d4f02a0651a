use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use rbi_lab::backtest::Backtest;
use rbi_lab::daemon::DaemonConfig;
use rbi_lab::{
    AnalyzeArgs, BacktestArgs, DaemonArgs, FetchArgs, OptimizeArgs, daemon, ohlcv, optimize,
    report, strategies,
};

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Collect OHLCV bars into CSVs
    Fetch(FetchArgs),
    /// Run one strategy over a CSV
    Backtest(BacktestArgs),
    /// Grid-sweep a strategy's parameters
    Optimize(OptimizeArgs),
    /// Leaderboard over saved reports
    Analyze(AnalyzeArgs),
    /// Collect/backtest/analyze/risk-check loop
    Daemon(DaemonArgs),
}

fn apply_fetch_defaults(args: &mut FetchArgs) {
    if args.out.is_none() {
        args.out = Some(PathBuf::from("./data"));
    }
    if args.days_back.is_none() {
        args.days_back = Some(3);
    }
    if args.timeframe.is_none() {
        args.timeframe = Some("15m".to_string());
    }
    if args.concurrency.is_none() {
        args.concurrency = Some(4);
    }
    if args.request_delay_ms.is_none() {
        args.request_delay_ms = Some(250);
    }
    if args.resume.is_none() {
        args.resume = Some(false);
    }
}

fn apply_backtest_defaults(args: &mut BacktestArgs) {
    if args.cash.is_none() {
        args.cash = Some(100_000.0);
    }
    if args.commission.is_none() {
        args.commission = Some(0.002);
    }
    if args.exclusive_orders.is_none() {
        args.exclusive_orders = Some(false);
    }
}

fn apply_optimize_defaults(args: &mut OptimizeArgs) {
    if args.cash.is_none() {
        args.cash = Some(100_000.0);
    }
    if args.commission.is_none() {
        args.commission = Some(0.002);
    }
    if args.maximize.is_none() {
        args.maximize = Some("return_pct".to_string());
    }
}

fn apply_analyze_defaults(args: &mut AnalyzeArgs) {
    if args.reports.is_none() {
        args.reports = Some(PathBuf::from("./out"));
    }
}

fn daemon_config(args: DaemonArgs) -> DaemonConfig {
    DaemonConfig {
        continuous: args.continuous.unwrap_or(false),
        check_interval: args.check_interval.unwrap_or(60),
        symbols: args.symbols.unwrap_or_default(),
        data_dir: args.data.unwrap_or_else(|| PathBuf::from("./data")),
        out_dir: args.out.unwrap_or_else(|| PathBuf::from("./out")),
        cash: args.cash.unwrap_or(100_000.0),
        commission: args.commission.unwrap_or(0.002),
        max_loss_percent: args.max_loss_percent.unwrap_or(2.0),
        max_gain_percent: args.max_gain_percent.unwrap_or(5.0),
    }
}

fn run_backtest(args: &BacktestArgs) -> Result<()> {
    let Some(name) = args.strategy.as_deref() else {
        println!("Available strategies:");
        for name in strategies::all_strategy_names() {
            println!("  {name}");
        }
        return Ok(());
    };
    let data = args
        .data
        .as_ref()
        .context("--data <csv> is required for backtest")?;
    let series = ohlcv::read_series(data)?;
    if series.is_empty() {
        bail!("no bars loaded from {}", data.display());
    }

    let mut strat = strategies::make(name, &HashMap::new())?;
    let report = Backtest::new(&series, args.cash.unwrap(), args.commission.unwrap())
        .exclusive_orders(args.exclusive_orders.unwrap())
        .run(strat.as_mut())?;
    report.print_summary();

    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)?;
        let stem = format!("{}_{}", report.strategy, report.symbol);
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(out.join(format!("report_{stem}.json")), json)?;
        report.write_equity_csv(&out.join(format!("equity_{stem}.csv")))?;
        report.write_trades_csv(&out.join(format!("trades_{stem}.csv")))?;
        println!("📄 Artifacts written to {}", out.display());
    }
    Ok(())
}

fn run_optimize(args: &OptimizeArgs) -> Result<()> {
    let name = args
        .strategy
        .as_deref()
        .context("--strategy <name> is required for optimize")?;
    let data = args
        .data
        .as_ref()
        .context("--data <csv> is required for optimize")?;
    let series = ohlcv::read_series(data)?;
    let metric: optimize::Metric = args.maximize.as_deref().unwrap().parse()?;

    let result = optimize::sweep(
        &series,
        name,
        args.cash.unwrap(),
        args.commission.unwrap(),
        metric,
    )?;

    println!(
        "🏆 Best of {} combinations (maximizing {metric}):",
        result.rows.len()
    );
    result.best.print_summary();

    if let Some(out) = &args.out {
        std::fs::create_dir_all(out)?;
        let sweep_path = out.join(format!("sweep_{}_{}.csv", name, series.symbol));
        optimize::write_sweep_csv(&result.rows, &sweep_path)?;
        let json = serde_json::to_string_pretty(&result.best)?;
        std::fs::write(
            out.join(format!("report_{}_{}.json", name, series.symbol)),
            json,
        )?;
        println!("📄 Sweep table written to {}", sweep_path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Fetch(mut fetch_args) => {
            apply_fetch_defaults(&mut fetch_args);
            ohlcv::execute(&fetch_args).await?;
        }
        Command::Backtest(mut backtest_args) => {
            apply_backtest_defaults(&mut backtest_args);
            run_backtest(&backtest_args)?;
        }
        Command::Optimize(mut optimize_args) => {
            apply_optimize_defaults(&mut optimize_args);
            run_optimize(&optimize_args)?;
        }
        Command::Analyze(mut analyze_args) => {
            apply_analyze_defaults(&mut analyze_args);
            report::execute(
                analyze_args.reports.as_ref().unwrap(),
                analyze_args.detailed.as_deref(),
            )?;
        }
        Command::Daemon(daemon_args) => {
            daemon::execute(daemon_config(daemon_args)).await?;
        }
    }
    Ok(())
}
