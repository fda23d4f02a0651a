//! Stochastic RSI phase trader. Buys when %K drops through the oversold
//! line, adds (DCA) on deeper oversold readings, and unwinds the whole
//! position when %K pops through the overbought line. Percent stop under
//! each entry, 1% of equity at risk.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::stoch_rsi;
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct StochasticPhase {
    rsi_period: usize,
    fastk: usize,
    fastd: usize,
    oversold: f64,
    overbought: f64,
    risk_frac: f64,
    sl_pct: f64,
    k: Vec<Option<f64>>,
    last_buy_k: Option<f64>,
}

impl StochasticPhase {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            rsi_period: param(params, "rsi_period", 14.0) as usize,
            fastk: param(params, "fastk", 3.0) as usize,
            fastd: param(params, "fastd", 3.0) as usize,
            oversold: param(params, "oversold", 20.0),
            overbought: param(params, "overbought", 80.0),
            risk_frac: param(params, "risk_frac", 0.01),
            sl_pct: param(params, "sl_pct", 0.02),
            k: Vec::new(),
            last_buy_k: None,
        }
    }
}

impl Strategy for StochasticPhase {
    fn name(&self) -> &'static str {
        "stochastic_phase"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("rsi_period", self.rsi_period as f64),
            ("oversold", self.oversold),
            ("overbought", self.overbought),
            ("risk_frac", self.risk_frac),
            ("sl_pct", self.sl_pct),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        let (k, _d) = stoch_rsi(&data.closes(), self.rsi_period, self.fastk, self.fastd);
        self.k = k;
        self.last_buy_k = None;
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if i == 0 {
            return Ok(());
        }
        let (Some(k), Some(k_prev)) = (self.k[i], self.k[i - 1]) else {
            return Ok(());
        };
        let close = data.bars[i].close;

        if k_prev >= self.oversold && k < self.oversold {
            let deeper = self.last_buy_k.is_none_or(|last| k < last);
            if !broker.is_long() || deeper {
                let sl = close * (1.0 - self.sl_pct);
                let units = risk_units(broker.equity(), self.risk_frac, close, sl).max(1.0);
                broker.buy(units, Some(sl), None)?;
                self.last_buy_k = Some(k);
            }
        } else if k_prev <= self.overbought && k > self.overbought && broker.is_long() {
            broker.close_position();
            self.last_buy_k = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::Backtest;
    use crate::ohlcv::Bar;
    use chrono::{Duration, NaiveDate};

    fn oscillating_series(n: usize, period: usize) -> Series {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let bars = (0..n)
            .map(|i| {
                let phase = (i as f64 / period as f64) * std::f64::consts::TAU;
                let c = 100.0 + 10.0 * phase.sin();
                Bar {
                    time: t0 + Duration::hours(i as i64),
                    open: c,
                    high: c + 0.5,
                    low: c - 0.5,
                    close: c,
                    volume: 1.0,
                }
            })
            .collect();
        Series::new("TEST", bars)
    }

    #[test]
    fn cycles_produce_round_trips() {
        let s = oscillating_series(300, 40);
        let mut strat = StochasticPhase::from_params(&HashMap::new());
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut strat).unwrap();
        assert!(report.n_trades >= 2);
        assert!(report.trades.iter().all(|t| t.units >= 1.0));
    }

    #[test]
    fn tighter_stop_changes_outcomes() {
        let s = oscillating_series(300, 40);
        let mut tight = HashMap::new();
        tight.insert("sl_pct".to_string(), 0.005);
        let mut a = StochasticPhase::from_params(&HashMap::new());
        let mut b = StochasticPhase::from_params(&tight);
        let ra = Backtest::new(&s, 100_000.0, 0.0).run(&mut a).unwrap();
        let rb = Backtest::new(&s, 100_000.0, 0.0).run(&mut b).unwrap();
        assert!(ra.sharpe.is_finite() && rb.sharpe.is_finite());
        assert_ne!(ra.equity_final, rb.equity_final);
    }
}
