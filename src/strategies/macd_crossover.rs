//! MACD signal-line crossover with ATR-sized brackets. Longs on a cross
//! above the signal line, shorts on a cross below; stop at 2x ATR, target
//! at 3x ATR, 1% of equity at risk per trade.

use anyhow::Result;
use std::collections::HashMap;

use crate::backtest::{BrokerHandle, Strategy, risk_units};
use crate::indicators::{atr, crossed_above, crossed_below, macd};
use crate::ohlcv::Series;
use crate::strategies::param;

pub struct MacdCrossover {
    fast: usize,
    slow: usize,
    signal: usize,
    atr_period: usize,
    risk_frac: f64,
    macd_line: Vec<Option<f64>>,
    macd_signal: Vec<Option<f64>>,
    atr: Vec<Option<f64>>,
}

impl MacdCrossover {
    pub fn from_params(params: &HashMap<String, f64>) -> Self {
        Self {
            fast: param(params, "fast", 12.0) as usize,
            slow: param(params, "slow", 26.0) as usize,
            signal: param(params, "signal", 9.0) as usize,
            atr_period: param(params, "atr_period", 14.0) as usize,
            risk_frac: param(params, "risk_frac", 0.01),
            macd_line: Vec::new(),
            macd_signal: Vec::new(),
            atr: Vec::new(),
        }
    }
}

impl Strategy for MacdCrossover {
    fn name(&self) -> &'static str {
        "macd_crossover"
    }

    fn params(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("fast", self.fast as f64),
            ("slow", self.slow as f64),
            ("signal", self.signal as f64),
            ("atr_period", self.atr_period as f64),
            ("risk_frac", self.risk_frac),
        ]
    }

    fn init(&mut self, data: &Series) -> Result<()> {
        let closes = data.closes();
        let (line, signal, _) = macd(&closes, self.fast, self.slow, self.signal);
        self.macd_line = line;
        self.macd_signal = signal;
        self.atr = atr(&data.highs(), &data.lows(), &closes, self.atr_period);
        Ok(())
    }

    fn next(&mut self, i: usize, data: &Series, broker: &mut BrokerHandle) -> Result<()> {
        if broker.has_position() {
            return Ok(());
        }
        let Some(a) = self.atr[i] else {
            return Ok(());
        };
        if a <= 0.0 {
            return Ok(());
        }
        let close = data.bars[i].close;

        if crossed_above(&self.macd_line, &self.macd_signal, i) {
            let sl = close - 2.0 * a;
            let tp = close + 3.0 * a;
            let units = risk_units(broker.equity(), self.risk_frac, close, sl);
            broker.buy(units, Some(sl), Some(tp))?;
        } else if crossed_below(&self.macd_line, &self.macd_signal, i) {
            let sl = close + 2.0 * a;
            let tp = close - 3.0 * a;
            if tp > 0.0 {
                let units = risk_units(broker.equity(), self.risk_frac, close, sl);
                broker.sell(units, Some(sl), Some(tp))?;
            }
        }
        Ok(())
    }
}
