//! Momentum continuation and rejection setups around 20-bar channel lines,
//! confirmed by a slow-stochastic %K/%D crossover. Four cases: breakout
//! continuation long/short and rejection reversals off either channel line.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy};
use crate::indicators::{crossed_above, crossed_below, rolling_max, rolling_min, stoch};
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct MomentumRejection {
    lookback: usize,
    stoch_period: usize,
    slowk: usize,
    slowd: usize,
    oversold: f64,
    overbought: f64,
    risk_frac: f64,
    k: Vec<Option<f64>>,
    d: Vec<Option<f64>>,
    upper: Vec<Option<f64>>,
    lower: Vec<Option<f64>>,
}

impl MomentumRejection {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            lookback: param(params, "lookback", 20.0) as usize,
            stoch_period: param(params, "stoch_period", 14.0) as usize,
            slowk: param(params, "slowk", 3.0) as usize,
            slowd: param(params, "slowd", 3.0) as usize,
            oversold: param(params, "oversold", 20.0),
            overbought: param(params, "overbought", 80.0),
            risk_frac: param(params, "risk_frac", 0.01),
            k: Vec::new(),
            d: Vec::new(),
            upper: Vec::new(),
            lower: Vec::new(),
        }
    }

    fn units_for(&self, equity: f64, price: f64) -> f64 {
        (equity * self.risk_frac / price).floor()
    }
}

impl Strategy for MomentumRejection {
    fn name(&self) -> &'static str {
        "momentum_rejection"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("lookback", self.lookback as f64),
            ("stoch_period", self.stoch_period as f64),
            ("oversold", self.oversold),
            ("overbought", self.overbought),
            ("risk_frac", self.risk_frac),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        let (k, d) = stoch(
            &data.highs(),
            &data.lows(),
            &data.closes(),
            self.stoch_period,
            self.slowk,
            self.slowd,
        );
        self.k = k;
        self.d = d;
        self.upper = rolling_max(&data.highs(), self.lookback);
        self.lower = rolling_min(&data.lows(), self.lookback);
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if i == 0 {
            return Ok(());
        }
        // channel lines are taken at i-1 so the current bar cannot move them
        let (Some(upper), Some(lower)) = (self.upper[i - 1], self.lower[i - 1]) else {
            return Ok(());
        };
        let Some(k) = self.k[i] else {
            return Ok(());
        };
        let bar = &data.bars[i];
        let bull_cross = crossed_above(&self.k, &self.d, i);
        let bear_cross = crossed_below(&self.k, &self.d, i);

        if broker.is_long() && bear_cross {
            broker.close_position();
            return Ok(());
        }
        if broker.is_short() && bull_cross {
            broker.close_position();
            return Ok(());
        }
        if broker.has_position() {
            return Ok(());
        }

        // continuation: a close beyond the channel line is its own trigger;
        // rejection reversals additionally want the %K/%D cross in the zone
        let breakout_up = bar.close > upper;
        let rejection_up =
            bar.low <= lower && bar.close > bar.open && bull_cross && k < self.oversold + 10.0;
        let breakout_down = bar.close < lower;
        let rejection_down =
            bar.high >= upper && bar.close < bar.open && bear_cross && k > self.overbought - 10.0;

        let units = self.units_for(broker.equity(), bar.close);
        if breakout_up || rejection_up {
            let sl = lower * 0.999;
            if sl < bar.close {
                broker.buy(units, Some(sl), None)?;
            }
        } else if breakout_down || rejection_down {
            let sl = upper * 1.001;
            if sl > bar.close {
                broker.sell(units, Some(sl), None)?;
            }
        }
        Ok(())
    }
}
