//! Strategy registry. Every strategy takes its parameters from a flat
//! name -> f64 map so the optimizer and CLI can drive them uniformly.

pub mod accumulation_manipulation;
pub mod atr_reversion;
pub mod dynamic_retest;
pub mod dynamic_validation;
pub mod gap_and_go;
pub mod macd_crossover;
pub mod momentum_rejection;
pub mod stochastic_phase;
pub mod timeframe_divergence;
pub mod timeframe_trend;
pub mod vengeance_trend;

use anyhow::{Result, bail};
use std::collections::HashMap;

use crate::backtest::Strategy;

pub const STRATEGY_NAMES: &[&str] = &[
    "macd_crossover",
    "atr_reversion",
    "stochastic_phase",
    "momentum_rejection",
    "gap_and_go",
    "dynamic_retest",
    "dynamic_validation",
    "accumulation_manipulation",
    "vengeance_trend",
    "timeframe_trend",
    "timeframe_divergence",
];

pub fn all_strategy_names() -> &'static [&'static str] {
    STRATEGY_NAMES
}

/// Instantiate a registered strategy, overriding defaults with `params`.
pub fn make(name: &str, params: &HashMap<String, f64>) -> Result<Box<dyn Strategy>> {
    let strat: Box<dyn Strategy> = match name {
        "macd_crossover" => Box::new(macd_crossover::MacdCrossover::from_params(params)),
        "atr_reversion" => Box::new(atr_reversion::AtrReversion::from_params(params)),
        "stochastic_phase" => Box::new(stochastic_phase::StochasticPhase::from_params(params)),
        "momentum_rejection" => {
            Box::new(momentum_rejection::MomentumRejection::from_params(params))
        }
        "gap_and_go" => Box::new(gap_and_go::GapAndGo::from_params(params)),
        "dynamic_retest" => Box::new(dynamic_retest::DynamicRetest::from_params(params)),
        "dynamic_validation" => {
            Box::new(dynamic_validation::DynamicValidation::from_params(params))
        }
        "accumulation_manipulation" => Box::new(
            accumulation_manipulation::AccumulationManipulation::from_params(params),
        ),
        "vengeance_trend" => Box::new(vengeance_trend::VengeanceTrend::from_params(params)),
        "timeframe_trend" => Box::new(timeframe_trend::TimeframeTrend::from_params(params)),
        "timeframe_divergence" => {
            Box::new(timeframe_divergence::TimeframeDivergence::from_params(params))
        }
        other => bail!("unknown strategy '{other}' (known: {})", STRATEGY_NAMES.join(", ")),
    };
    Ok(strat)
}

/// A sweepable parameter space: per-axis candidate values plus an optional
/// combination constraint.
pub struct ParamGrid {
    pub axes: Vec<(&'static str, Vec<f64>)>,
    pub constraint: Option<fn(&HashMap<String, f64>) -> bool>,
}

/// Sweep definitions for the strategies the scripts actually optimized.
pub fn grid(name: &str) -> Result<ParamGrid> {
    let grid = match name {
        "macd_crossover" => ParamGrid {
            axes: vec![
                ("fast", vec![8.0, 12.0, 16.0]),
                ("slow", vec![21.0, 26.0, 34.0]),
                ("signal", vec![7.0, 9.0, 11.0]),
            ],
            constraint: Some(|p| p["fast"] < p["slow"]),
        },
        "stochastic_phase" => ParamGrid {
            axes: vec![
                ("oversold", vec![15.0, 20.0]),
                ("overbought", vec![75.0, 80.0]),
                ("sl_pct", vec![0.01, 0.02, 0.03]),
            ],
            constraint: Some(|p| p["oversold"] < p["overbought"]),
        },
        "vengeance_trend" => ParamGrid {
            axes: vec![
                ("atr_period", vec![10.0, 12.0, 14.0, 16.0, 18.0, 20.0]),
                ("risk_frac", vec![0.01, 0.02]),
            ],
            constraint: None,
        },
        "gap_and_go" => ParamGrid {
            axes: vec![
                ("gap_pct", vec![0.01, 0.02, 0.03]),
                ("risk_reward", vec![1.5, 2.0, 3.0]),
            ],
            constraint: None,
        },
        "dynamic_validation" => ParamGrid {
            axes: vec![
                ("swing_period", vec![15.0, 20.0, 25.0, 30.0]),
                ("risk_reward", vec![3.0, 4.0, 5.0]),
            ],
            constraint: None,
        },
        "accumulation_manipulation" => ParamGrid {
            axes: vec![("risk_reward", vec![1.5, 2.0, 2.5])],
            constraint: None,
        },
        "timeframe_divergence" => ParamGrid {
            axes: vec![
                ("risk_frac", vec![0.005, 0.01, 0.015, 0.02]),
                ("risk_reward", vec![2.0, 3.0]),
                ("conso_factor", vec![0.8, 1.0, 1.2]),
            ],
            constraint: None,
        },
        other => bail!("no parameter grid defined for strategy '{other}'"),
    };
    Ok(grid)
}

/// Parameter lookup with a default, shared by all strategies.
pub(crate) fn param(params: &HashMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds_every_strategy() {
        let params = HashMap::new();
        for name in all_strategy_names() {
            let strat = make(name, &params).unwrap();
            assert_eq!(strat.name(), *name);
        }
    }

    #[test]
    fn unknown_strategy_is_an_error() {
        assert!(make("no_such_thing", &HashMap::new()).is_err());
    }

    #[test]
    fn params_override_defaults() {
        let mut params = HashMap::new();
        params.insert("fast".to_string(), 5.0);
        let strat = make("macd_crossover", &params).unwrap();
        let got = strat
            .params()
            .into_iter()
            .find(|(k, _)| *k == "fast")
            .unwrap();
        assert_eq!(got.1, 5.0);
    }

    #[test]
    fn grids_respect_constraints() {
        let g = grid("stochastic_phase").unwrap();
        let constraint = g.constraint.unwrap();
        let mut p = HashMap::new();
        p.insert("oversold".to_string(), 20.0);
        p.insert("overbought".to_string(), 80.0);
        assert!(constraint(&p));
        p.insert("oversold".to_string(), 90.0);
        assert!(!constraint(&p));
    }
}
