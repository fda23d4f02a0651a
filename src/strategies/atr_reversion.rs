//! Mean reversion on ATR-sized moves: buy a one-bar drop deeper than one
//! ATR with all available cash, exit once price snaps back by one ATR.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy};
use crate::indicators::atr;
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct AtrReversion {
    atr_period: usize,
    atr: Vec<Option<f64>>,
}

impl AtrReversion {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            atr_period: param(params, "atr_period", 14.0) as usize,
            atr: Vec::new(),
        }
    }
}

impl Strategy for AtrReversion {
    fn name(&self) -> &'static str {
        "atr_reversion"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![("atr_period", self.atr_period as f64)]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        self.atr = atr(&data.highs(), &data.lows(), &data.closes(), self.atr_period);
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if i == 0 {
            return Ok(());
        }
        let Some(a) = self.atr[i] else {
            return Ok(());
        };
        let close = data.bars[i].close;
        let prev_close = data.bars[i - 1].close;

        if !broker.has_position() && close < prev_close - a {
            broker.buy_max()?;
        } else if broker.is_long() && close > prev_close + a {
            broker.close_position();
        }
        Ok(())
    }
}
