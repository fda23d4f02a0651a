//! Rolling indicator kit covering the TA-Lib calls the strategies make.
//! Every function returns one output slot per input bar, `None` until the
//! lookback is filled.

use statrs::statistics::Statistics;

/// Simple moving average over a window of `w` values.
pub fn sma(x: &[f64], w: usize) -> Vec<Option<f64>> {
    if w == 0 {
        return vec![None; x.len()];
    }
    let mut out = vec![None; x.len()];
    let mut sum = 0.0;
    for i in 0..x.len() {
        sum += x[i];
        if i >= w {
            sum -= x[i - w];
        }
        if i + 1 >= w {
            out[i] = Some(sum / w as f64);
        }
    }
    out
}

/// Exponential moving average, seeded with the SMA of the first `w` values.
pub fn ema(x: &[f64], w: usize) -> Vec<Option<f64>> {
    if w == 0 || x.len() < w {
        return vec![None; x.len()];
    }
    let mut out = vec![None; x.len()];
    let alpha = 2.0 / (w as f64 + 1.0);
    let seed = x[..w].iter().sum::<f64>() / w as f64;
    out[w - 1] = Some(seed);
    let mut prev = seed;
    for i in w..x.len() {
        prev = alpha * x[i] + (1.0 - alpha) * prev;
        out[i] = Some(prev);
    }
    out
}

/// Relative strength index with Wilder smoothing.
pub fn rsi(close: &[f64], w: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; close.len()];
    if w == 0 || close.len() <= w {
        return out;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=w {
        let delta = close[i] - close[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= w as f64;
    avg_loss /= w as f64;
    out[w] = Some(rsi_value(avg_gain, avg_loss));
    for i in w + 1..close.len() {
        let delta = close[i] - close[i - 1];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (w as f64 - 1.0) + gain) / w as f64;
        avg_loss = (avg_loss * (w as f64 - 1.0) + loss) / w as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

pub fn true_range(high: f64, low: f64, prev_close: f64) -> f64 {
    (high - low)
        .abs()
        .max((high - prev_close).abs())
        .max((low - prev_close).abs())
}

/// Average true range, Wilder-smoothed like `talib.ATR`.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], w: usize) -> Vec<Option<f64>> {
    let n = close.len();
    let mut out = vec![None; n];
    if w == 0 || n <= w {
        return out;
    }
    let tr = |i: usize| {
        if i == 0 {
            high[0] - low[0]
        } else {
            true_range(high[i], low[i], close[i - 1])
        }
    };
    let mut prev = (0..=w).skip(1).map(tr).sum::<f64>() / w as f64;
    out[w] = Some(prev);
    for i in w + 1..n {
        prev = (prev * (w as f64 - 1.0) + tr(i)) / w as f64;
        out[i] = Some(prev);
    }
    out
}

/// MACD line, signal line and histogram.
pub fn macd(
    close: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let ema_fast = ema(close, fast);
    let ema_slow = ema(close, slow);
    let line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(&ema_slow)
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // Signal is an EMA over the defined stretch of the MACD line.
    let first = line.iter().position(|v| v.is_some()).unwrap_or(line.len());
    let defined: Vec<f64> = line[first..].iter().map(|v| v.unwrap()).collect();
    let sig_defined = ema(&defined, signal);
    let mut sig = vec![None; close.len()];
    for (offset, v) in sig_defined.into_iter().enumerate() {
        sig[first + offset] = v;
    }

    let hist: Vec<Option<f64>> = line
        .iter()
        .zip(&sig)
        .map(|(l, s)| match (l, s) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        })
        .collect();
    (line, sig, hist)
}

/// Rolling minimum over `w` values.
pub fn rolling_min(x: &[f64], w: usize) -> Vec<Option<f64>> {
    rolling_extreme(x, w, |s| s.iter().cloned().fold(f64::INFINITY, f64::min))
}

/// Rolling maximum over `w` values.
pub fn rolling_max(x: &[f64], w: usize) -> Vec<Option<f64>> {
    rolling_extreme(x, w, |s| s.iter().cloned().fold(f64::NEG_INFINITY, f64::max))
}

fn rolling_extreme(x: &[f64], w: usize, f: impl Fn(&[f64]) -> f64) -> Vec<Option<f64>> {
    let mut out = vec![None; x.len()];
    if w == 0 {
        return out;
    }
    for i in 0..x.len() {
        if i + 1 >= w {
            out[i] = Some(f(&x[i + 1 - w..=i]));
        }
    }
    out
}

/// Rolling standard deviation (population) over `w` values.
pub fn rolling_std(x: &[f64], w: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; x.len()];
    if w == 0 {
        return out;
    }
    for i in 0..x.len() {
        if i + 1 >= w {
            let s = &x[i + 1 - w..=i];
            let mean = s.mean();
            let var = s.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / s.len() as f64;
            out[i] = Some(var.sqrt());
        }
    }
    out
}

/// Slow stochastic oscillator (`talib.STOCH` with SMA smoothing): raw %K
/// from the `fastk` lookback, then SMA(`slowk`) and SMA(`slowd`).
pub fn stoch(
    high: &[f64],
    low: &[f64],
    close: &[f64],
    fastk: usize,
    slowk: usize,
    slowd: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let hh = rolling_max(high, fastk);
    let ll = rolling_min(low, fastk);
    let raw: Vec<Option<f64>> = (0..close.len())
        .map(|i| match (hh[i], ll[i]) {
            (Some(h), Some(l)) if h > l => Some(100.0 * (close[i] - l) / (h - l)),
            (Some(_), Some(_)) => Some(50.0),
            _ => None,
        })
        .collect();
    let k = sma_of_options(&raw, slowk);
    let d = sma_of_options(&k, slowd);
    (k, d)
}

/// Stochastic RSI as the original scripts built it: RSI, its rolling
/// min/max over the same period, then SMA-smoothed %K and %D.
pub fn stoch_rsi(
    close: &[f64],
    period: usize,
    fastk: usize,
    fastd: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let r = rsi(close, period);
    let defined_start = r.iter().position(|v| v.is_some()).unwrap_or(r.len());
    let rsi_vals: Vec<f64> = r[defined_start..].iter().map(|v| v.unwrap()).collect();
    let min_r = rolling_min(&rsi_vals, period);
    let max_r = rolling_max(&rsi_vals, period);
    let stoch_vals: Vec<Option<f64>> = (0..rsi_vals.len())
        .map(|i| match (min_r[i], max_r[i]) {
            (Some(lo), Some(hi)) => Some(100.0 * (rsi_vals[i] - lo) / (hi - lo + 1e-10)),
            _ => None,
        })
        .collect();
    let k_local = sma_of_options(&stoch_vals, fastk);
    let d_local = sma_of_options(&k_local, fastd);

    let mut k = vec![None; close.len()];
    let mut d = vec![None; close.len()];
    for i in 0..rsi_vals.len() {
        k[defined_start + i] = k_local[i];
        d[defined_start + i] = d_local[i];
    }
    (k, d)
}

/// Cumulative volume-weighted average price over typical prices.
pub fn vwap(high: &[f64], low: &[f64], close: &[f64], volume: &[f64]) -> Vec<f64> {
    let mut cum_vol = 0.0;
    let mut cum_pv = 0.0;
    (0..close.len())
        .map(|i| {
            let typical = (high[i] + low[i] + close[i]) / 3.0;
            cum_vol += volume[i];
            cum_pv += typical * volume[i];
            cum_pv / if cum_vol == 0.0 { 1.0 } else { cum_vol }
        })
        .collect()
}

/// SMA over an already-gappy series; a window only yields a value once all
/// its inputs are defined.
fn sma_of_options(x: &[Option<f64>], w: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; x.len()];
    if w == 0 {
        return out;
    }
    for i in 0..x.len() {
        if i + 1 < w {
            continue;
        }
        let window = &x[i + 1 - w..=i];
        if window.iter().all(|v| v.is_some()) {
            out[i] = Some(window.iter().map(|v| v.unwrap()).sum::<f64>() / w as f64);
        }
    }
    out
}

/// True when series `a` crossed above series `b` at index `i`.
pub fn crossed_above(a: &[Option<f64>], b: &[Option<f64>], i: usize) -> bool {
    if i == 0 {
        return false;
    }
    matches!(
        (a[i - 1], b[i - 1], a[i], b[i]),
        (Some(ap), Some(bp), Some(ac), Some(bc)) if ap <= bp && ac > bc
    )
}

/// True when series `a` crossed below series `b` at index `i`.
pub fn crossed_below(a: &[Option<f64>], b: &[Option<f64>], i: usize) -> bool {
    if i == 0 {
        return false;
    }
    matches!(
        (a[i - 1], b[i - 1], a[i], b[i]),
        (Some(ap), Some(bp), Some(ac), Some(bc)) if ap >= bp && ac < bc
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn sma_basic() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(out[0], None);
        assert!(approx(out[1].unwrap(), 1.5));
        assert!(approx(out[2].unwrap(), 2.5));
        assert!(approx(out[3].unwrap(), 3.5));
    }

    #[test]
    fn ema_seeds_with_sma() {
        let out = ema(&[1.0, 2.0, 3.0, 4.0], 3);
        assert_eq!(out[1], None);
        assert!(approx(out[2].unwrap(), 2.0));
        // alpha = 0.5: 0.5*4 + 0.5*2 = 3
        assert!(approx(out[3].unwrap(), 3.0));
    }

    #[test]
    fn rsi_extremes() {
        let up: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let out = rsi(&up, 14);
        assert_eq!(out[13], None);
        assert!(approx(out[14].unwrap(), 100.0));

        let down: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let out = rsi(&down, 14);
        assert!(out[19].unwrap() < 1e-9);
    }

    #[test]
    fn atr_flat_series_equals_range() {
        let high = vec![12.0; 20];
        let low = vec![10.0; 20];
        let close = vec![11.0; 20];
        let out = atr(&high, &low, &close, 14);
        assert_eq!(out[13], None);
        assert!(approx(out[14].unwrap(), 2.0));
        assert!(approx(out[19].unwrap(), 2.0));
    }

    #[test]
    fn macd_defined_after_slow_plus_signal() {
        let close: Vec<f64> = (0..60).map(|i| 100.0 + (i as f64).sin()).collect();
        let (line, sig, hist) = macd(&close, 12, 26, 9);
        assert_eq!(line[24], None);
        assert!(line[25].is_some());
        assert_eq!(sig[32], None);
        assert!(sig[33].is_some());
        let h = hist[33].unwrap();
        assert!(approx(h, line[33].unwrap() - sig[33].unwrap()));
    }

    #[test]
    fn rolling_min_max() {
        let x = [3.0, 1.0, 4.0, 1.5, 5.0];
        assert_eq!(rolling_max(&x, 3)[2], Some(4.0));
        assert_eq!(rolling_min(&x, 3)[3], Some(1.0));
        assert_eq!(rolling_max(&x, 3)[4], Some(5.0));
    }

    #[test]
    fn stoch_bounds() {
        let high: Vec<f64> = (0..40).map(|i| 10.0 + (i % 7) as f64).collect();
        let low: Vec<f64> = high.iter().map(|h| h - 2.0).collect();
        let close: Vec<f64> = high.iter().map(|h| h - 1.0).collect();
        let (k, d) = stoch(&high, &low, &close, 14, 3, 3);
        for i in 0..40 {
            if let Some(v) = k[i] {
                assert!((0.0..=100.0).contains(&v));
            }
            if let Some(v) = d[i] {
                assert!((0.0..=100.0).contains(&v));
            }
        }
        assert!(k[20].is_some());
        assert!(d[20].is_some());
    }

    #[test]
    fn stoch_rsi_defined_eventually() {
        let close: Vec<f64> = (0..80).map(|i| 100.0 + ((i * 13) % 17) as f64).collect();
        let (k, d) = stoch_rsi(&close, 14, 3, 3);
        assert!(k[60].is_some());
        assert!(d[60].is_some());
        assert!((0.0..=100.0).contains(&k[60].unwrap()));
    }

    #[test]
    fn vwap_tracks_typical_price() {
        let high = [12.0, 20.0];
        let low = [8.0, 16.0];
        let close = [10.0, 18.0];
        let volume = [100.0, 100.0];
        let out = vwap(&high, &low, &close, &volume);
        assert!(approx(out[0], 10.0));
        assert!(approx(out[1], 14.0));
    }

    #[test]
    fn vwap_zero_volume_does_not_divide_by_zero() {
        let out = vwap(&[10.0], &[10.0], &[10.0], &[0.0]);
        assert!(out[0].is_finite());
    }

    #[test]
    fn cross_helpers() {
        let a = vec![Some(1.0), Some(3.0), Some(2.0)];
        let b = vec![Some(2.0), Some(2.0), Some(2.5)];
        assert!(crossed_above(&a, &b, 1));
        assert!(!crossed_above(&a, &b, 2));
        assert!(crossed_below(&a, &b, 2));
        assert!(!crossed_below(&a, &b, 0));
    }
}
