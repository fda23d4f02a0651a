//! Dynamic zone validation. Treats the rolling swing low as a demand zone
//! and the rolling swing high as supply: a close touching demand goes long
//! with the stop just under the zone, a close touching supply goes short
//! with the stop just above, each targeting a fixed multiple of the risk.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::{rolling_max, rolling_min};
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct DynamicValidation {
    swing_period: usize,
    risk_reward: f64,
    risk_frac: f64,
    demand: Vec<Option<f64>>,
    supply: Vec<Option<f64>>,
}

impl DynamicValidation {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            swing_period: param(params, "swing_period", 20.0) as usize,
            risk_reward: param(params, "risk_reward", 3.0),
            risk_frac: param(params, "risk_frac", 0.02),
            demand: Vec::new(),
            supply: Vec::new(),
        }
    }
}

impl Strategy for DynamicValidation {
    fn name(&self) -> &'static str {
        "dynamic_validation"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("swing_period", self.swing_period as f64),
            ("risk_reward", self.risk_reward),
            ("risk_frac", self.risk_frac),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        self.demand = rolling_min(&data.lows(), self.swing_period);
        self.supply = rolling_max(&data.highs(), self.swing_period);
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if broker.has_position() {
            return Ok(());
        }
        let (Some(demand), Some(supply)) = (self.demand[i], self.supply[i]) else {
            return Ok(());
        };
        let close = data.bars[i].close;

        // long takes priority when a tight range touches both zones
        if close <= demand * 1.01 {
            let sl = demand * 0.999;
            let risk = close - sl;
            if risk > 0.0 {
                let tp = close + risk * self.risk_reward;
                let units = risk_units(broker.equity(), self.risk_frac, close, sl).max(1.0);
                broker.buy(units, Some(sl), Some(tp))?;
            }
        } else if close >= supply * 0.99 {
            let sl = supply * 1.001;
            let risk = sl - close;
            if risk > 0.0 {
                let tp = close - risk * self.risk_reward;
                if tp > 0.0 {
                    let units = risk_units(broker.equity(), self.risk_frac, close, sl).max(1.0);
                    broker.sell(units, Some(sl), Some(tp))?;
                }
            }
        }
        Ok(())
    }
}
