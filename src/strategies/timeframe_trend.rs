//! Multi-timeframe trend alignment. Resamples the source bars to 1h, 4h,
//! daily and weekly, calls each timeframe up or down from its close versus
//! a 20-bar SMA, and goes long only when the three higher timeframes agree
//! and price takes out the last completed 1h high. Stop under the recent
//! swing low, exit when the 4h trend flips.

use anyhow::Result;
use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::{rolling_min, sma};
use crate::ohlcv::{Series, Timeframe, resample};
use crate::strategies::param;

struct TfView {
    times: Vec<NaiveDateTime>,
    highs: Vec<f64>,
    up: Vec<Option<bool>>,
}

impl TfView {
    fn build(series: &Series, tf: Timeframe, sma_period: usize) -> Self {
        let res = resample(series, tf);
        let closes = res.closes();
        let ma = sma(&closes, sma_period);
        let up = closes
            .iter()
            .zip(&ma)
            .map(|(c, m)| m.map(|m| *c > m))
            .collect();
        Self {
            times: res.bars.iter().map(|b| b.time).collect(),
            highs: res.highs(),
            up,
        }
    }

    /// Index of the latest bucket completed at or before `t`. Buckets are
    /// right-labeled, so a bucket is final once its label time has passed.
    fn latest(&self, t: NaiveDateTime) -> Option<usize> {
        let n = self.times.partition_point(|x| *x <= t);
        n.checked_sub(1)
    }

    fn trend_up(&self, t: NaiveDateTime) -> Option<bool> {
        self.latest(t).and_then(|i| self.up[i])
    }
}

pub struct TimeframeTrend {
    sma_period: usize,
    swing_bars: usize,
    risk_frac: f64,
    h1: Option<TfView>,
    h4: Option<TfView>,
    d1: Option<TfView>,
    w1: Option<TfView>,
    swing_low: Vec<Option<f64>>,
}

impl TimeframeTrend {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            sma_period: param(params, "sma_period", 20.0) as usize,
            swing_bars: param(params, "swing_bars", 20.0) as usize,
            risk_frac: param(params, "risk_frac", 0.01),
            h1: None,
            h4: None,
            d1: None,
            w1: None,
            swing_low: Vec::new(),
        }
    }
}

impl Strategy for TimeframeTrend {
    fn name(&self) -> &'static str {
        "timeframe_trend"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("sma_period", self.sma_period as f64),
            ("swing_bars", self.swing_bars as f64),
            ("risk_frac", self.risk_frac),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        self.h1 = Some(TfView::build(data, Timeframe::H1, self.sma_period));
        self.h4 = Some(TfView::build(data, Timeframe::H4, self.sma_period));
        self.d1 = Some(TfView::build(data, Timeframe::D1, self.sma_period));
        self.w1 = Some(TfView::build(data, Timeframe::W1, self.sma_period));
        self.swing_low = rolling_min(&data.lows(), self.swing_bars);
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        let (Some(h1), Some(h4), Some(d1), Some(w1)) =
            (&self.h1, &self.h4, &self.d1, &self.w1)
        else {
            return Ok(());
        };
        let bar = &data.bars[i];
        let t = bar.time;

        if broker.is_long() {
            if h4.trend_up(t) == Some(false) {
                broker.close_position();
            }
            return Ok(());
        }

        let aligned = [w1.trend_up(t), d1.trend_up(t), h4.trend_up(t)]
            .iter()
            .all(|u| *u == Some(true));
        if !aligned {
            return Ok(());
        }
        let Some(h1_idx) = h1.latest(t) else {
            return Ok(());
        };
        if bar.close <= h1.highs[h1_idx] {
            return Ok(());
        }
        let Some(stop) = (i > 0).then(|| self.swing_low[i - 1]).flatten() else {
            return Ok(());
        };
        if stop >= bar.close {
            return Ok(());
        }
        let units = risk_units(broker.equity(), self.risk_frac, bar.close, stop);
        broker.buy(units, Some(stop), None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::Backtest;
    use crate::ohlcv::Bar;
    use chrono::{Duration, NaiveDate};

    /// Months of 15m bars grinding upward keep every timeframe aligned.
    fn long_uptrend() -> Series {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let n = 96 * 180; // ~180 days of 15m bars
        let bars = (0..n)
            .map(|i| {
                let c = 100.0 + i as f64 * 0.01;
                Bar {
                    time: t0 + Duration::minutes(15 * i as i64),
                    open: c,
                    high: c + 0.02,
                    low: c - 0.02,
                    close: c,
                    volume: 1.0,
                }
            })
            .collect();
        Series::new("TEST", bars)
    }

    #[test]
    fn aligned_trend_goes_long() {
        let s = long_uptrend();
        let mut strat = TimeframeTrend::from_params(&HashMap::new());
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut strat).unwrap();
        assert!(report.n_trades >= 1);
        assert!(report.trades[0].units > 0.0);
        assert!(report.exposure_pct > 10.0);
    }

    #[test]
    fn no_longs_when_higher_timeframes_point_down() {
        let t0 = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let n = 96 * 180;
        let bars = (0..n)
            .map(|i| {
                let c = 3000.0 - i as f64 * 0.01;
                Bar {
                    time: t0 + Duration::minutes(15 * i as i64),
                    open: c,
                    high: c + 0.3,
                    low: c - 0.3,
                    close: c,
                    volume: 1.0,
                }
            })
            .collect();
        let s = Series::new("TEST", bars);
        let mut strat = TimeframeTrend::from_params(&HashMap::new());
        let report = Backtest::new(&s, 100_000.0, 0.0).run(&mut strat).unwrap();
        assert_eq!(report.n_trades, 0);
    }
}
