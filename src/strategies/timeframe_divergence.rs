//! Multi-timeframe divergence. With the last completed weekly and daily
//! candles both bullish and the latest completed 4h bar compressed versus
//! its recent median range, the last completed 1h candle's direction arms a
//! pending signal; the trade fires when price breaks the 1h range, with the
//! stop at the far side of that range.

use anyhow::Result;
use chrono::NaiveDateTime;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::ohlcv::{Series, Timeframe, resample};
use crate::strategies::param;

#[derive(Clone, Copy, PartialEq)]
enum Armed {
    Long,
    Short,
}

struct TfBars {
    times: Vec<NaiveDateTime>,
    opens: Vec<f64>,
    highs: Vec<f64>,
    lows: Vec<f64>,
    closes: Vec<f64>,
}

impl TfBars {
    fn build(series: &Series, tf: Timeframe) -> Self {
        let res = resample(series, tf);
        Self {
            times: res.bars.iter().map(|b| b.time).collect(),
            opens: res.opens(),
            highs: res.highs(),
            lows: res.lows(),
            closes: res.closes(),
        }
    }

    /// Index of the latest bucket completed at or before `t`.
    fn latest(&self, t: NaiveDateTime) -> Option<usize> {
        self.times.partition_point(|x| *x <= t).checked_sub(1)
    }

    fn bullish(&self, i: usize) -> bool {
        self.closes[i] > self.opens[i]
    }

    fn range(&self, i: usize) -> f64 {
        self.highs[i] - self.lows[i]
    }
}

pub struct TimeframeDivergence {
    risk_frac: f64,
    risk_reward: f64,
    conso_factor: f64,
    armed: Option<Armed>,
    h1: Option<TfBars>,
    h4: Option<TfBars>,
    d1: Option<TfBars>,
    w1: Option<TfBars>,
}

impl TimeframeDivergence {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            risk_frac: param(params, "risk_frac", 0.01),
            risk_reward: param(params, "risk_reward", 2.0),
            conso_factor: param(params, "conso_factor", 1.0),
            armed: None,
            h1: None,
            h4: None,
            d1: None,
            w1: None,
        }
    }

    fn h4_consolidating(&self, h4: &TfBars, i: usize) -> bool {
        let lo = i.saturating_sub(9);
        let mut recent: Vec<f64> = (lo..=i).map(|j| h4.range(j)).collect();
        recent.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let mid = recent.len() / 2;
        let median = if recent.len() % 2 == 0 {
            (recent[mid - 1] + recent[mid]) / 2.0
        } else {
            recent[mid]
        };
        h4.range(i) < self.conso_factor * median
    }
}

impl Strategy for TimeframeDivergence {
    fn name(&self) -> &'static str {
        "timeframe_divergence"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("risk_frac", self.risk_frac),
            ("risk_reward", self.risk_reward),
            ("conso_factor", self.conso_factor),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        self.h1 = Some(TfBars::build(data, Timeframe::H1));
        self.h4 = Some(TfBars::build(data, Timeframe::H4));
        self.d1 = Some(TfBars::build(data, Timeframe::D1));
        self.w1 = Some(TfBars::build(data, Timeframe::W1));
        self.armed = None;
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        let (Some(h1), Some(h4), Some(d1), Some(w1)) = (&self.h1, &self.h4, &self.d1, &self.w1)
        else {
            return Ok(());
        };
        if broker.has_position() {
            return Ok(());
        }
        let bar = &data.bars[i];
        let t = bar.time;

        if self.armed.is_none()
            && let (Some(wi), Some(di), Some(qi)) = (w1.latest(t), d1.latest(t), h4.latest(t))
            && w1.bullish(wi)
            && d1.bullish(di)
            && self.h4_consolidating(h4, qi)
            && let Some(hi) = h1.latest(t)
        {
            if h1.bullish(hi) {
                self.armed = Some(Armed::Long);
            } else if h1.closes[hi] < h1.opens[hi] {
                self.armed = Some(Armed::Short);
            }
        }

        let Some(side) = self.armed else {
            return Ok(());
        };
        let Some(hi) = h1.latest(t) else {
            return Ok(());
        };
        match side {
            Armed::Long if bar.close > h1.highs[hi] => {
                let sl = h1.lows[hi];
                let risk = bar.close - sl;
                if risk > 0.0 {
                    let tp = bar.close + risk * self.risk_reward;
                    let units = risk_units(broker.equity(), self.risk_frac, bar.close, sl);
                    broker.buy(units, Some(sl), Some(tp))?;
                }
                self.armed = None;
            }
            Armed::Short if bar.close < h1.lows[hi] => {
                let sl = h1.highs[hi];
                let risk = sl - bar.close;
                let tp = bar.close - risk * self.risk_reward;
                if risk > 0.0 && tp > 0.0 {
                    let units = risk_units(broker.equity(), self.risk_frac, bar.close, sl);
                    broker.sell(units, Some(sl), Some(tp))?;
                }
                self.armed = None;
            }
            _ => {}
        }
        Ok(())
    }
}
