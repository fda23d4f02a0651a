//! Bar-by-bar backtesting engine. Orders placed while processing bar `i`
//! fill at bar `i+1`'s open; stop-loss and take-profit brackets are checked
//! intrabar against high/low, stop first when both would trigger.

use anyhow::{Result, bail};
use chrono::NaiveDateTime;
use csv::WriterBuilder;
use serde::Serialize;
use statrs::statistics::Statistics;
use std::fs;
use std::path::Path;

use crate::ohlcv::{Bar, Series};

/// A strategy drives the engine: `init` precomputes indicator columns over
/// the whole series, `next` is called once per bar with data up to and
/// including that bar.
pub trait Strategy {
    fn name(&self) -> &'static str;

    /// Current parameter values, for reporting and sweep tables.
    fn params(&self) -> Vec<(&'static str, f64)> {
        Vec::new()
    }

    fn init(&mut self, data: &Series) -> Result<()>;

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()>;
}

/// Whole-unit position size for a fixed equity fraction at risk.
/// Returns zero when the stop distance is non-positive.
pub fn risk_units(equity: f64, risk_frac: f64, entry: f64, stop: f64) -> f64 {
    let risk_per_unit = (entry - stop).abs();
    if risk_per_unit <= 0.0 || !risk_per_unit.is_finite() {
        return 0.0;
    }
    (equity * risk_frac / risk_per_unit).floor().max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    Signal,
    StopLoss,
    TakeProfit,
    EndOfData,
}

/// A completed round trip. DCA adds merge into the aggregate position, so
/// one trade records the volume-weighted entry.
#[derive(Debug, Clone, Serialize)]
pub struct Trade {
    pub entry_time: NaiveDateTime,
    pub exit_time: NaiveDateTime,
    pub units: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub return_pct: f64,
    pub reason: ExitReason,
}

#[derive(Debug, Clone)]
struct OpenPosition {
    units: f64, // signed: >0 long, <0 short
    entry_price: f64,
    sl: Option<f64>,
    tp: Option<f64>,
    entry_time: NaiveDateTime,
}

#[derive(Debug, Clone)]
enum Pending {
    Entry {
        units: f64, // signed
        sl: Option<f64>,
        tp: Option<f64>,
    },
    Close,
}

struct Broker {
    cash: f64,
    commission: f64,
    exclusive_orders: bool,
    position: Option<OpenPosition>,
    pending: Vec<Pending>,
    trades: Vec<Trade>,
}

impl Broker {
    fn new(cash: f64, commission: f64, exclusive_orders: bool) -> Self {
        Self {
            cash,
            commission,
            exclusive_orders,
            position: None,
            pending: Vec::new(),
            trades: Vec::new(),
        }
    }

    fn equity(&self, price: f64) -> f64 {
        match &self.position {
            Some(p) => self.cash + p.units * price,
            None => self.cash,
        }
    }

    fn exit_position(&mut self, price: f64, time: NaiveDateTime, reason: ExitReason) {
        let Some(p) = self.position.take() else {
            return;
        };
        let notional = p.units.abs() * price;
        if p.units > 0.0 {
            self.cash += p.units * price;
        } else {
            self.cash -= p.units.abs() * price;
        }
        self.cash -= self.commission * notional;

        let pnl = p.units * (price - p.entry_price);
        let return_pct = if p.units > 0.0 {
            (price / p.entry_price - 1.0) * 100.0
        } else {
            (p.entry_price / price - 1.0) * 100.0
        };
        self.trades.push(Trade {
            entry_time: p.entry_time,
            exit_time: time,
            units: p.units,
            entry_price: p.entry_price,
            exit_price: price,
            pnl,
            return_pct,
            reason,
        });
    }

    fn enter(
        &mut self,
        units: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        price: f64,
        time: NaiveDateTime,
    ) {
        let notional = units.abs() * price;
        if units > 0.0 {
            self.cash -= notional;
        } else {
            self.cash += notional;
        }
        self.cash -= self.commission * notional;

        match &mut self.position {
            // Same-direction add: volume-weighted entry, latest bracket wins.
            Some(p) if p.units.signum() == units.signum() => {
                let total = p.units + units;
                p.entry_price = (p.entry_price * p.units + price * units) / total;
                p.units = total;
                if sl.is_some() {
                    p.sl = sl;
                }
                if tp.is_some() {
                    p.tp = tp;
                }
            }
            _ => {
                self.position = Some(OpenPosition {
                    units,
                    entry_price: price,
                    sl,
                    tp,
                    entry_time: time,
                });
            }
        }
    }

    /// Fill everything queued during the previous bar at this bar's open.
    fn process_pending(&mut self, bar: &Bar) {
        let pending = std::mem::take(&mut self.pending);
        for order in pending {
            match order {
                Pending::Close => {
                    self.exit_position(bar.open, bar.time, ExitReason::Signal);
                }
                Pending::Entry { units, sl, tp } => {
                    let opposite = self
                        .position
                        .as_ref()
                        .is_some_and(|p| p.units.signum() != units.signum());
                    if opposite || (self.exclusive_orders && self.position.is_some()) {
                        self.exit_position(bar.open, bar.time, ExitReason::Signal);
                    }
                    self.enter(units, sl, tp, bar.open, bar.time);
                }
            }
        }
    }

    /// Intrabar bracket check. Gaps past a level fill at the open; the stop
    /// wins when both sides of the bracket fall inside one bar.
    fn check_brackets(&mut self, bar: &Bar) {
        let Some(p) = self.position.clone() else {
            return;
        };
        if p.units > 0.0 {
            if let Some(sl) = p.sl
                && bar.open <= sl
            {
                return self.exit_position(bar.open, bar.time, ExitReason::StopLoss);
            }
            if let Some(sl) = p.sl
                && bar.low <= sl
            {
                return self.exit_position(sl, bar.time, ExitReason::StopLoss);
            }
            if let Some(tp) = p.tp
                && bar.open >= tp
            {
                return self.exit_position(bar.open, bar.time, ExitReason::TakeProfit);
            }
            if let Some(tp) = p.tp
                && bar.high >= tp
            {
                return self.exit_position(tp, bar.time, ExitReason::TakeProfit);
            }
        } else {
            if let Some(sl) = p.sl
                && bar.open >= sl
            {
                return self.exit_position(bar.open, bar.time, ExitReason::StopLoss);
            }
            if let Some(sl) = p.sl
                && bar.high >= sl
            {
                return self.exit_position(sl, bar.time, ExitReason::StopLoss);
            }
            if let Some(tp) = p.tp
                && bar.open <= tp
            {
                return self.exit_position(bar.open, bar.time, ExitReason::TakeProfit);
            }
            if let Some(tp) = p.tp
                && bar.low <= tp
            {
                return self.exit_position(tp, bar.time, ExitReason::TakeProfit);
            }
        }
    }
}

/// Strategy-facing view of the broker for one bar.
pub struct BrokerHandle<'a> {
    broker: &'a mut Broker,
    last_close: f64,
}

impl BrokerHandle<'_> {
    pub fn equity(&self) -> f64 {
        self.broker.equity(self.last_close)
    }

    pub fn cash(&self) -> f64 {
        self.broker.cash
    }

    /// Signed open units: positive long, negative short, zero flat.
    pub fn position_units(&self) -> f64 {
        self.broker.position.as_ref().map_or(0.0, |p| p.units)
    }

    pub fn has_position(&self) -> bool {
        self.broker.position.is_some()
    }

    pub fn is_long(&self) -> bool {
        self.position_units() > 0.0
    }

    pub fn is_short(&self) -> bool {
        self.position_units() < 0.0
    }

    pub fn entry_price(&self) -> Option<f64> {
        self.broker.position.as_ref().map(|p| p.entry_price)
    }

    /// Queue a long entry, filled at the next bar's open. Zero or negative
    /// sizes are silently skipped, matching the scripts' `if size > 0` guard;
    /// oversized orders are cut down to what cash can carry.
    pub fn buy(&mut self, units: f64, sl: Option<f64>, tp: Option<f64>) -> Result<()> {
        let affordable = (self.broker.cash / (self.last_close * (1.0 + self.broker.commission)))
            .floor()
            .max(0.0);
        let units = units.min(affordable);
        if units <= 0.0 {
            return Ok(());
        }
        if let Some(sl) = sl
            && sl >= self.last_close
        {
            bail!("long stop {sl} not below price {}", self.last_close);
        }
        if let Some(tp) = tp
            && tp <= self.last_close
        {
            bail!("long target {tp} not above price {}", self.last_close);
        }
        self.broker.pending.push(Pending::Entry { units, sl, tp });
        Ok(())
    }

    /// Queue a short entry, filled at the next bar's open. Notional is
    /// capped at current equity, as on the long side.
    pub fn sell(&mut self, units: f64, sl: Option<f64>, tp: Option<f64>) -> Result<()> {
        let affordable = (self.equity() / self.last_close).floor().max(0.0);
        let units = units.min(affordable);
        if units <= 0.0 {
            return Ok(());
        }
        if let Some(sl) = sl
            && sl <= self.last_close
        {
            bail!("short stop {sl} not above price {}", self.last_close);
        }
        if let Some(tp) = tp
            && tp >= self.last_close
        {
            bail!("short target {tp} not below price {}", self.last_close);
        }
        self.broker.pending.push(Pending::Entry {
            units: -units,
            sl,
            tp,
        });
        Ok(())
    }

    /// Long entry with (almost) all available cash, in whole units.
    pub fn buy_max(&mut self) -> Result<()> {
        let units = (self.broker.cash * 0.99 / self.last_close).floor();
        self.buy(units, None, None)
    }

    /// Queue a close of the whole position, filled at the next bar's open.
    pub fn close_position(&mut self) {
        if self.broker.position.is_some() {
            self.broker.pending.push(Pending::Close);
        }
    }

    /// Replace the stop on the open position (trailing stops).
    pub fn set_sl(&mut self, sl: f64) {
        if let Some(p) = &mut self.broker.position {
            p.sl = Some(sl);
        }
    }
}

/// Engine configuration, mirroring `Backtest(data, Strat, cash=..,
/// commission=.., exclusive_orders=..)`.
pub struct Backtest<'a> {
    series: &'a Series,
    cash: f64,
    commission: f64,
    exclusive_orders: bool,
}

impl<'a> Backtest<'a> {
    pub fn new(series: &'a Series, cash: f64, commission: f64) -> Self {
        Self {
            series,
            cash,
            commission,
            exclusive_orders: false,
        }
    }

    pub fn exclusive_orders(mut self, yes: bool) -> Self {
        self.exclusive_orders = yes;
        self
    }

    pub fn run(&self, strategy: &mut dyn Strategy) -> Result<BacktestReport> {
        if self.series.len() < 2 {
            bail!("need at least 2 bars, got {}", self.series.len());
        }
        strategy.init(self.series)?;

        let mut broker = Broker::new(self.cash, self.commission, self.exclusive_orders);
        let mut equity_curve = Vec::with_capacity(self.series.len());
        let mut bars_in_market = 0usize;

        for (i, bar) in self.series.bars.iter().enumerate() {
            broker.process_pending(bar);
            broker.check_brackets(bar);

            let mut handle = BrokerHandle {
                broker: &mut broker,
                last_close: bar.close,
            };
            strategy.next(i, self.series, &mut handle)?;

            if broker.position.is_some() {
                bars_in_market += 1;
            }
            equity_curve.push(broker.equity(bar.close));
        }

        // Liquidate at the final close so stats see realized numbers.
        let last = *self.series.bars.last().unwrap();
        broker.exit_position(last.close, last.time, ExitReason::EndOfData);
        *equity_curve.last_mut().unwrap() = broker.cash;

        Ok(BacktestReport::compute(
            strategy,
            self.series,
            self.cash,
            equity_curve,
            broker.trades,
            bars_in_market,
        ))
    }
}

/// Upper bound reported for profit factor when a run has no losing trades.
pub const PROFIT_FACTOR_CAP: f64 = 1_000.0;

/// The stats block every script printed, plus the raw curve and trades.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub strategy: String,
    pub params: Vec<(String, f64)>,
    pub symbol: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub bars: usize,
    pub exposure_pct: f64,
    pub equity_initial: f64,
    pub equity_final: f64,
    pub equity_peak: f64,
    pub return_pct: f64,
    pub buy_hold_return_pct: f64,
    pub max_drawdown_pct: f64,
    pub sharpe: f64,
    pub n_trades: usize,
    pub win_rate_pct: f64,
    pub profit_factor: f64,
    pub avg_trade_pct: f64,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
    #[serde(skip)]
    pub equity_curve: Vec<f64>,
    pub trades: Vec<Trade>,
}

impl BacktestReport {
    fn compute(
        strategy: &dyn Strategy,
        series: &Series,
        cash: f64,
        equity_curve: Vec<f64>,
        trades: Vec<Trade>,
        bars_in_market: usize,
    ) -> Self {
        let n = series.len();
        let equity_final = *equity_curve.last().unwrap_or(&cash);
        let equity_peak = equity_curve.iter().cloned().fold(cash, f64::max);

        let first_close = series.bars.first().map_or(1.0, |b| b.close);
        let last_close = series.bars.last().map_or(1.0, |b| b.close);

        let mut peak = f64::MIN;
        let mut mdd = 0.0f64;
        for &e in &equity_curve {
            if e > peak {
                peak = e;
            }
            let dd = 1.0 - e / peak;
            if dd > mdd {
                mdd = dd;
            }
        }

        // Per-bar equity returns, annualized by the dataset's bar spacing.
        let rets: Vec<f64> = equity_curve
            .windows(2)
            .map(|w| (w[1] - w[0]) / w[0])
            .filter(|r| r.is_finite())
            .collect();
        let bars_per_year = 365.25 * 86_400.0 / series.median_bar_secs() as f64;
        let sharpe = if rets.len() > 1 {
            let mean = rets.iter().sum::<f64>() / rets.len() as f64;
            let sd = (rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>()
                / (rets.len() as f64 - 1.0))
                .sqrt();
            if sd > 0.0 {
                mean / sd * bars_per_year.sqrt()
            } else {
                0.0
            }
        } else {
            0.0
        };

        let wins: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p < 0.0).collect();
        let win_rate_pct = if trades.is_empty() {
            0.0
        } else {
            wins.len() as f64 / trades.len() as f64 * 100.0
        };
        let gross_win = wins.iter().sum::<f64>();
        let gross_loss = losses.iter().sum::<f64>().abs();
        // Runs with no losing trade cap the ratio so every stat stays a
        // real JSON number and survives the report round trip.
        let profit_factor = if gross_loss > 0.0 {
            (gross_win / gross_loss).min(PROFIT_FACTOR_CAP)
        } else if gross_win > 0.0 {
            PROFIT_FACTOR_CAP
        } else {
            0.0
        };
        let trade_rets: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let avg_trade_pct = if trade_rets.is_empty() {
            0.0
        } else {
            trade_rets.clone().mean()
        };
        let (best_trade_pct, worst_trade_pct) = if trade_rets.is_empty() {
            (0.0, 0.0)
        } else {
            (
                trade_rets.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                trade_rets.iter().cloned().fold(f64::INFINITY, f64::min),
            )
        };

        Self {
            strategy: strategy.name().to_string(),
            params: strategy
                .params()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            symbol: series.symbol.clone(),
            start: series.bars.first().map(|b| b.time).unwrap_or_default(),
            end: series.bars.last().map(|b| b.time).unwrap_or_default(),
            bars: n,
            exposure_pct: bars_in_market as f64 / n as f64 * 100.0,
            equity_initial: cash,
            equity_final,
            equity_peak,
            return_pct: (equity_final / cash - 1.0) * 100.0,
            buy_hold_return_pct: (last_close / first_close - 1.0) * 100.0,
            max_drawdown_pct: mdd * 100.0,
            sharpe,
            n_trades: trades.len(),
            win_rate_pct,
            profit_factor,
            avg_trade_pct,
            best_trade_pct,
            worst_trade_pct,
            equity_curve,
            trades,
        }
    }

    /// Profitable the way the daemon leaderboard defines it.
    pub fn is_profitable(&self) -> bool {
        self.return_pct > 0.0 && self.win_rate_pct > 50.0 && self.profit_factor > 1.0
    }

    pub fn print_summary(&self) {
        println!("📊 {} on {}", self.strategy, self.symbol);
        if !self.params.is_empty() {
            let params = self
                .params
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", ");
            println!("   Params: {params}");
        }
        println!("   Start: {}  End: {}  Bars: {}", self.start, self.end, self.bars);
        println!("   Exposure: {:.1}%", self.exposure_pct);
        println!("   Equity Final: ${:.2}", self.equity_final);
        println!("   Equity Peak: ${:.2}", self.equity_peak);
        println!("   Return: {:.2}%", self.return_pct);
        println!("   Buy & Hold Return: {:.2}%", self.buy_hold_return_pct);
        println!("   Max Drawdown: {:.2}%", self.max_drawdown_pct);
        println!("   Sharpe (ann.): {:.2}", self.sharpe);
        println!("   Trades: {}", self.n_trades);
        println!("   Win Rate: {:.1}%", self.win_rate_pct);
        println!("   Profit Factor: {:.2}", self.profit_factor);
        println!(
            "   Avg Trade: {:.2}%  Best: {:.2}%  Worst: {:.2}%",
            self.avg_trade_pct, self.best_trade_pct, self.worst_trade_pct
        );
        println!();
    }

    pub fn write_equity_csv(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).ok();
        let mut wtr = WriterBuilder::new().from_path(path)?;
        wtr.write_record(["bar", "equity"])?;
        for (i, e) in self.equity_curve.iter().enumerate() {
            wtr.write_record(&[i.to_string(), format!("{e:.8}")])?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_trades_csv(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path.parent().unwrap_or(Path::new("."))).ok();
        let mut wtr = WriterBuilder::new().from_path(path)?;
        wtr.write_record([
            "entry_time",
            "exit_time",
            "units",
            "entry_price",
            "exit_price",
            "pnl",
            "return_pct",
            "reason",
        ])?;
        for t in &self.trades {
            wtr.write_record(&[
                t.entry_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                t.exit_time.format("%Y-%m-%d %H:%M:%S").to_string(),
                format!("{:.4}", t.units),
                format!("{:.8}", t.entry_price),
                format!("{:.8}", t.exit_price),
                format!("{:.4}", t.pnl),
                format!("{:.4}", t.return_pct),
                format!("{:?}", t.reason),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(bars: &[(f64, f64, f64, f64)]) -> Series {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        Series::new(
            "TEST",
            bars.iter()
                .enumerate()
                .map(|(i, &(o, h, l, c))| Bar {
                    time: t0 + chrono::Duration::minutes(15 * i as i64),
                    open: o,
                    high: h,
                    low: l,
                    close: c,
                    volume: 1.0,
                })
                .collect(),
        )
    }

    /// Buys a fixed clip on a chosen bar, optionally with a bracket.
    struct ScriptedBuy {
        on_bar: usize,
        units: f64,
        sl: Option<f64>,
        tp: Option<f64>,
        close_on: Option<usize>,
    }

    impl Strategy for ScriptedBuy {
        fn name(&self) -> &'static str {
            "scripted_buy"
        }
        fn init(&mut self, _data: &Series) -> Result<()> {
            Ok(())
        }
        fn next(&mut self, i: usize, _data: &Series, broker: &mut BrokerHandle) -> Result<()> {
            if i == self.on_bar {
                broker.buy(self.units, self.sl, self.tp)?;
            }
            if Some(i) == self.close_on {
                broker.close_position();
            }
            Ok(())
        }
    }

    #[test]
    fn fills_at_next_bar_open() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (102.0, 103.0, 101.0, 102.0), // fill here at 102
            (102.0, 105.0, 101.0, 104.0),
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: None,
            tp: None,
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.n_trades, 1);
        let t = &report.trades[0];
        assert_eq!(t.entry_price, 102.0);
        assert_eq!(t.exit_price, 104.0); // liquidated at final close
        assert_eq!(t.reason, ExitReason::EndOfData);
        assert!((report.equity_final - (10_000.0 + 10.0 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_fills_intrabar() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry at 100, sl 95
            (100.0, 100.0, 90.0, 92.0),  // low breaches stop -> fill at 95
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: Some(95.0),
            tp: None,
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        let t = &report.trades[0];
        assert_eq!(t.exit_price, 95.0);
        assert_eq!(t.reason, ExitReason::StopLoss);
        assert!((t.pnl - 10.0 * -5.0).abs() < 1e-9);
    }

    #[test]
    fn stop_beats_target_in_same_bar() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),  // entry at 100, sl 95, tp 105
            (100.0, 110.0, 90.0, 100.0),  // both levels inside the bar
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 5.0,
            sl: Some(95.0),
            tp: Some(105.0),
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.trades[0].reason, ExitReason::StopLoss);
        assert_eq!(report.trades[0].exit_price, 95.0);
    }

    #[test]
    fn gap_through_stop_fills_at_open() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry at 100, sl 95
            (88.0, 92.0, 85.0, 90.0),    // gaps below the stop
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: Some(95.0),
            tp: None,
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.trades[0].exit_price, 88.0);
        assert_eq!(report.trades[0].reason, ExitReason::StopLoss);
    }

    #[test]
    fn take_profit_fills_at_target() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry at 100, tp 105
            (101.0, 108.0, 100.0, 107.0),
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: None,
            tp: Some(105.0),
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.trades[0].exit_price, 105.0);
        assert_eq!(report.trades[0].reason, ExitReason::TakeProfit);
    }

    #[test]
    fn all_wins_keep_stats_finite_and_loadable() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry at 100, tp 105
            (101.0, 108.0, 100.0, 107.0), // target fills, the only trade wins
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: None,
            tp: Some(105.0),
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.n_trades, 1);
        assert!(report.profit_factor.is_finite());
        assert_eq!(report.profit_factor, PROFIT_FACTOR_CAP);

        // the saved report must round-trip into the leaderboard
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("null"));
        let summary: crate::report::RunSummary = serde_json::from_str(&json).unwrap();
        assert!(summary.is_profitable());
    }

    #[test]
    fn loss_only_runs_report_the_real_extremes() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry at 100, sl 95
            (100.0, 100.0, 90.0, 92.0),  // stopped out at 95
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: Some(95.0),
            tp: None,
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.n_trades, 1);
        assert!(report.best_trade_pct < 0.0);
        assert!((report.best_trade_pct - report.worst_trade_pct).abs() < 1e-12);
        assert_eq!(report.profit_factor, 0.0);
    }

    #[test]
    fn commission_charged_both_sides() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry at 100
            (100.0, 101.0, 99.0, 100.0),
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: None,
            tp: None,
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.002).run(&mut strat).unwrap();
        // flat price: lose 0.2% of 1000 notional on entry and again on exit
        assert!((report.equity_final - (10_000.0 - 2.0 * 2.0)).abs() < 1e-9);
    }

    #[test]
    fn close_fills_next_open() {
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // entry
            (103.0, 104.0, 102.0, 103.0), // close queued here...
            (106.0, 107.0, 105.0, 106.0), // ...fills at 106
        ]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: None,
            tp: None,
            close_on: Some(2),
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.trades[0].exit_price, 106.0);
        assert_eq!(report.trades[0].reason, ExitReason::Signal);
    }

    #[test]
    fn rejects_inverted_long_bracket() {
        let s = series(&[(100.0, 101.0, 99.0, 100.0), (100.0, 101.0, 99.0, 100.0)]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 10.0,
            sl: Some(100.0), // not below price
            tp: None,
            close_on: None,
        };
        assert!(Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).is_err());
    }

    #[test]
    fn zero_size_is_skipped() {
        let s = series(&[(100.0, 101.0, 99.0, 100.0), (100.0, 101.0, 99.0, 100.0)]);
        let mut strat = ScriptedBuy {
            on_bar: 0,
            units: 0.0,
            sl: None,
            tp: None,
            close_on: None,
        };
        let report = Backtest::new(&s, 10_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.n_trades, 0);
        assert_eq!(report.equity_final, 10_000.0);
    }

    #[test]
    fn short_trade_profits_on_decline() {
        struct ScriptedSell;
        impl Strategy for ScriptedSell {
            fn name(&self) -> &'static str {
                "scripted_sell"
            }
            fn init(&mut self, _data: &Series) -> Result<()> {
                Ok(())
            }
            fn next(&mut self, i: usize, _d: &Series, broker: &mut BrokerHandle) -> Result<()> {
                if i == 0 {
                    broker.sell(10.0, Some(110.0), Some(90.0))?;
                }
                Ok(())
            }
        }
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // short entry at 100
            (95.0, 96.0, 89.0, 91.0),    // tp 90 touched
        ]);
        let report = Backtest::new(&s, 10_000.0, 0.0)
            .run(&mut ScriptedSell)
            .unwrap();
        let t = &report.trades[0];
        assert_eq!(t.reason, ExitReason::TakeProfit);
        assert!((t.pnl - 100.0).abs() < 1e-9); // -10 units * (90 - 100)
        assert!((report.equity_final - 10_100.0).abs() < 1e-9);
    }

    #[test]
    fn dca_add_merges_with_weighted_entry() {
        struct Dca;
        impl Strategy for Dca {
            fn name(&self) -> &'static str {
                "dca"
            }
            fn init(&mut self, _data: &Series) -> Result<()> {
                Ok(())
            }
            fn next(&mut self, i: usize, _d: &Series, broker: &mut BrokerHandle) -> Result<()> {
                if i == 0 || i == 1 {
                    broker.buy(10.0, None, None)?;
                }
                Ok(())
            }
        }
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0), // first fill at 100
            (110.0, 111.0, 109.0, 110.0), // second fill at 110
            (120.0, 121.0, 119.0, 120.0),
        ]);
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut Dca).unwrap();
        assert_eq!(report.n_trades, 1);
        let t = &report.trades[0];
        assert_eq!(t.units, 20.0);
        assert!((t.entry_price - 105.0).abs() < 1e-9);
        assert!((t.pnl - 20.0 * 15.0).abs() < 1e-9);
    }

    #[test]
    fn exclusive_orders_replace_position() {
        struct Flip;
        impl Strategy for Flip {
            fn name(&self) -> &'static str {
                "flip"
            }
            fn init(&mut self, _data: &Series) -> Result<()> {
                Ok(())
            }
            fn next(&mut self, i: usize, _d: &Series, broker: &mut BrokerHandle) -> Result<()> {
                if i == 0 {
                    broker.buy(10.0, None, None)?;
                }
                if i == 1 {
                    broker.buy(5.0, None, None)?;
                }
                Ok(())
            }
        }
        let s = series(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (102.0, 103.0, 101.0, 102.0),
            (104.0, 105.0, 103.0, 104.0),
        ]);
        let report = Backtest::new(&s, 100_000.0, 0.0)
            .exclusive_orders(true)
            .run(&mut Flip)
            .unwrap();
        // first clip closed when the second entry fills
        assert_eq!(report.n_trades, 2);
        assert_eq!(report.trades[0].units, 10.0);
        assert_eq!(report.trades[1].units, 5.0);
    }

    #[test]
    fn stats_are_finite_without_trades() {
        struct Idle;
        impl Strategy for Idle {
            fn name(&self) -> &'static str {
                "idle"
            }
            fn init(&mut self, _data: &Series) -> Result<()> {
                Ok(())
            }
            fn next(&mut self, _i: usize, _d: &Series, _b: &mut BrokerHandle) -> Result<()> {
                Ok(())
            }
        }
        let s = series(&[(1.0, 1.0, 1.0, 1.0), (1.0, 1.0, 1.0, 1.0)]);
        let report = Backtest::new(&s, 1_000.0, 0.0).run(&mut Idle).unwrap();
        assert_eq!(report.n_trades, 0);
        assert_eq!(report.win_rate_pct, 0.0);
        assert_eq!(report.profit_factor, 0.0);
        assert!(report.sharpe.is_finite());
        assert!(report.max_drawdown_pct.abs() < 1e-9);
        assert!(!report.is_profitable());
    }

    #[test]
    fn risk_units_sizing() {
        assert_eq!(risk_units(100_000.0, 0.01, 100.0, 95.0), 200.0);
        assert_eq!(risk_units(100_000.0, 0.01, 100.0, 100.0), 0.0);
        assert_eq!(risk_units(100_000.0, 0.01, 95.0, 100.0), 200.0);
    }
}
