//! Channel-breakout trend rider with an ATR trailing stop. Enters on a
//! 20-bar donchian break, then ratchets the stop behind price by a fixed
//! ATR multiple and never loosens it.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::{atr, rolling_max, rolling_min};
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct VengeanceTrend {
    atr_period: usize,
    channel: usize,
    trail_mult: f64,
    risk_frac: f64,
    atr: Vec<Option<f64>>,
    upper: Vec<Option<f64>>,
    lower: Vec<Option<f64>>,
    trail: Option<f64>,
}

impl VengeanceTrend {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            atr_period: param(params, "atr_period", 14.0) as usize,
            channel: param(params, "channel", 20.0) as usize,
            trail_mult: param(params, "trail_mult", 2.0),
            risk_frac: param(params, "risk_frac", 0.01),
            atr: Vec::new(),
            upper: Vec::new(),
            lower: Vec::new(),
            trail: None,
        }
    }
}

impl Strategy for VengeanceTrend {
    fn name(&self) -> &'static str {
        "vengeance_trend"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("atr_period", self.atr_period as f64),
            ("channel", self.channel as f64),
            ("trail_mult", self.trail_mult),
            ("risk_frac", self.risk_frac),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        let closes = data.closes();
        self.atr = atr(&data.highs(), &data.lows(), &closes, self.atr_period);
        self.upper = rolling_max(&data.highs(), self.channel);
        self.lower = rolling_min(&data.lows(), self.channel);
        self.trail = None;
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if i == 0 {
            return Ok(());
        }
        let (Some(upper), Some(lower)) = (self.upper[i - 1], self.lower[i - 1]) else {
            return Ok(());
        };
        let Some(a) = self.atr[i] else {
            return Ok(());
        };
        if a <= 0.0 {
            return Ok(());
        }
        let bar = &data.bars[i];

        if !broker.has_position() {
            self.trail = None;
            if bar.close > upper {
                let sl = bar.close - self.trail_mult * a;
                let units = risk_units(broker.equity(), self.risk_frac, bar.close, sl);
                broker.buy(units, Some(sl), None)?;
                self.trail = Some(sl);
            } else if bar.close < lower {
                let sl = bar.close + self.trail_mult * a;
                let units = risk_units(broker.equity(), self.risk_frac, bar.close, sl);
                broker.sell(units, Some(sl), None)?;
                self.trail = Some(sl);
            }
            return Ok(());
        }

        if broker.is_long() {
            let candidate = bar.low - self.trail_mult * a;
            let trail = match self.trail {
                Some(t) if t >= candidate => t,
                _ => candidate,
            };
            self.trail = Some(trail);
            broker.set_sl(trail);
            if bar.close < trail {
                broker.close_position();
            }
        } else {
            let candidate = bar.high + self.trail_mult * a;
            let trail = match self.trail {
                Some(t) if t <= candidate => t,
                _ => candidate,
            };
            self.trail = Some(trail);
            broker.set_sl(trail);
            if bar.close > trail {
                broker.close_position();
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

    fn series(closes: &[f64]) -> Series {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                time: t0 + Duration::hours(i as i64),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 1.0,
            })
            .collect();
        Series::new("TEST", bars)
    }

    #[test]
    fn rides_a_trend_and_exits_on_the_trail() {
        // chop, a long markup, then a hard reversal through the trail
        let mut closes: Vec<f64> = (0..25)
            .map(|i| if i % 2 == 0 { 99.5 } else { 100.5 })
            .collect();
        for j in 1..=30 {
            closes.push(101.0 + j as f64 * 0.5);
        }
        for j in 1..=10 {
            closes.push(116.0 - j as f64 * 2.0);
        }
        let s = series(&closes);

        let mut strat = VengeanceTrend::from_params(&HashMap::new());
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut strat).unwrap();
        assert!(report.n_trades >= 1);
        let t = &report.trades[0];
        assert!(t.units > 0.0);
        assert!(t.pnl > 0.0); // the trail locks in most of the markup
    }

    #[test]
    fn trail_never_loosens() {
        // after the markup the trail must not drop even as ATR expands
        let mut closes: Vec<f64> = (0..25).map(|_| 100.0).collect();
        for j in 1..=20 {
            closes.push(100.0 + j as f64);
        }
        let s = series(&closes);
        let mut strat = VengeanceTrend::from_params(&HashMap::new());
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut strat).unwrap();
        // still long at the end, liquidated at the final close
        assert_eq!(report.n_trades, 1);
        assert_eq!(
            report.trades[0].reason,
            crate::backtest::ExitReason::EndOfData
        );
        assert!(report.trades[0].pnl > 0.0);
    }
}
