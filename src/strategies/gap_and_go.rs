//! Gap-and-go: a bar that opens well above the prior close, pulls back to
//! the 9-bar SMA or session VWAP, then takes out the prior high. Stop under
//! the pullback low, target at a fixed risk multiple, early exit on a close
//! below the fast SMA.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::{sma, vwap};
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct GapAndGo {
    gap_pct: f64,
    risk_frac: f64,
    risk_reward: f64,
    sma_period: usize,
    sma: Vec<Option<f64>>,
    vwap: Vec<f64>,
}

impl GapAndGo {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            gap_pct: param(params, "gap_pct", 0.02),
            risk_frac: param(params, "risk_frac", 0.01),
            risk_reward: param(params, "risk_reward", 2.0),
            sma_period: param(params, "sma_period", 9.0) as usize,
            sma: Vec::new(),
            vwap: Vec::new(),
        }
    }
}

impl Strategy for GapAndGo {
    fn name(&self) -> &'static str {
        "gap_and_go"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("gap_pct", self.gap_pct),
            ("risk_frac", self.risk_frac),
            ("risk_reward", self.risk_reward),
            ("sma_period", self.sma_period as f64),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        self.sma = sma(&data.closes(), self.sma_period);
        self.vwap = vwap(&data.highs(), &data.lows(), &data.closes(), &data.volumes());
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if i == 0 {
            return Ok(());
        }
        let Some(fast_ma) = self.sma[i] else {
            return Ok(());
        };
        let bar = &data.bars[i];
        let prev = &data.bars[i - 1];

        if broker.is_long() {
            if bar.close < fast_ma {
                broker.close_position();
            }
            return Ok(());
        }

        let gapped = bar.open >= prev.close * (1.0 + self.gap_pct);
        let pulled_back =
            bar.low <= fast_ma * 1.001 || bar.low <= self.vwap[i] * 1.001;
        let broke_out = bar.high > prev.high;

        if gapped && pulled_back && broke_out {
            let entry = bar.close;
            let sl = bar.low;
            if sl < entry {
                let tp = entry + (entry - sl) * self.risk_reward;
                let units = risk_units(broker.equity(), self.risk_frac, entry, sl);
                broker.buy(units, Some(sl), Some(tp))?;
            }
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

    fn bar(t0: chrono::NaiveDateTime, i: usize, o: f64, h: f64, l: f64, c: f64) -> Bar {
        Bar {
            time: t0 + Duration::minutes(15 * i as i64),
            open: o,
            high: h,
            low: l,
            close: c,
            volume: 100.0,
        }
    }

    #[test]
    fn gap_pullback_breakout_enters_with_bracket() {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let mut bars = Vec::new();
        // flat base around 100 keeps sma and vwap near price
        for i in 0..12 {
            bars.push(bar(t0, i, 100.0, 100.5, 99.5, 100.0));
        }
        // gap up 5%, dip back to the fast ma, take out the prior high
        bars.push(bar(t0, 12, 105.0, 106.0, 100.2, 105.5));
        // bracket resolution bars
        bars.push(bar(t0, 13, 105.5, 106.0, 105.0, 105.8));
        bars.push(bar(t0, 14, 105.8, 118.0, 105.5, 117.0));
        let s = Series::new("TEST", bars);

        let mut strat = GapAndGo::from_params(&HashMap::new());
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.n_trades, 1);
        let t = &report.trades[0];
        assert_eq!(t.entry_price, 105.5); // next bar's open
        assert_eq!(t.reason, crate::backtest::ExitReason::TakeProfit);
        assert!(t.pnl > 0.0);
    }
}
