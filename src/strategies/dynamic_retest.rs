//! Dynamic support retest. In an uptrend (closes above a rising SMA),
//! buys a pullback into the recent consolidation zone with the stop just
//! under the zone floor, but only when the 2.5R target still fits inside
//! twice the zone's own range.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::{rolling_max, rolling_min, sma};
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct DynamicRetest {
    sma_period: usize,
    zone_span: usize,
    trend_bars: usize,
    min_rr: f64,
    risk_frac: f64,
    sma: Vec<Option<f64>>,
    zone_top: Vec<Option<f64>>,
    zone_bottom: Vec<Option<f64>>,
}

impl DynamicRetest {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            sma_period: param(params, "sma_period", 20.0) as usize,
            zone_span: param(params, "zone_span", 16.0) as usize,
            trend_bars: param(params, "trend_bars", 3.0) as usize,
            min_rr: param(params, "min_rr", 2.5),
            risk_frac: param(params, "risk_frac", 0.01),
            sma: Vec::new(),
            zone_top: Vec::new(),
            zone_bottom: Vec::new(),
        }
    }

    fn in_uptrend(&self, i: usize, data: &Series) -> bool {
        if i < self.trend_bars {
            return false;
        }
        let (Some(now), Some(then)) = (self.sma[i], self.sma[i - self.trend_bars]) else {
            return false;
        };
        if now <= then {
            return false;
        }
        (i - self.trend_bars + 1..=i).all(|j| match self.sma[j] {
            Some(m) => data.bars[j].close > m,
            None => false,
        })
    }
}

impl Strategy for DynamicRetest {
    fn name(&self) -> &'static str {
        "dynamic_retest"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("sma_period", self.sma_period as f64),
            ("zone_span", self.zone_span as f64),
            ("trend_bars", self.trend_bars as f64),
            ("min_rr", self.min_rr),
            ("risk_frac", self.risk_frac),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        self.sma = sma(&data.closes(), self.sma_period);
        self.zone_top = rolling_max(&data.highs(), self.zone_span);
        self.zone_bottom = rolling_min(&data.lows(), self.zone_span);
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if i == 0 || broker.has_position() {
            return Ok(());
        }
        let (Some(top), Some(bottom)) = (self.zone_top[i - 1], self.zone_bottom[i - 1]) else {
            return Ok(());
        };
        if !self.in_uptrend(i, data) {
            return Ok(());
        }
        let close = data.bars[i].close;
        if close < bottom || close > top {
            return Ok(());
        }

        let risk = close - bottom;
        let zone_range = top - bottom;
        if risk <= 0.0 || zone_range <= 0.0 {
            return Ok(());
        }
        // a target the zone itself cannot plausibly deliver is skipped
        if risk * self.min_rr > 2.0 * zone_range {
            return Ok(());
        }
        let sl = bottom * 0.999;
        let tp = close + risk * self.min_rr;
        let units = risk_units(broker.equity(), self.risk_frac, close, sl);
        broker.buy(units, Some(sl), Some(tp))?;
        Ok(())
    }
}
