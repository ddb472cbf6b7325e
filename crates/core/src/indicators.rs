//! Windowed technical indicators
//!
//! Pure functions over nullable float slices. Warmup rows (and rows whose
//! window touches a null input) come back as `None`; output length always
//! equals input length.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The builtin indicator set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Indicator {
    /// Simple moving average
    Sma,
    /// Exponential moving average
    Ema,
    /// Relative strength index (Wilder)
    Rsi,
    /// Moving average convergence/divergence
    Macd,
    /// Bollinger bands
    Bb,
    /// Stochastic oscillator
    Stoch,
    /// Average true range (Wilder)
    Atr,
}

impl Indicator {
    /// All builtin indicators.
    pub fn all() -> [Indicator; 7] {
        [
            Indicator::Sma,
            Indicator::Ema,
            Indicator::Rsi,
            Indicator::Macd,
            Indicator::Bb,
            Indicator::Stoch,
            Indicator::Atr,
        ]
    }

    /// Canonical uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Indicator::Sma => "SMA",
            Indicator::Ema => "EMA",
            Indicator::Rsi => "RSI",
            Indicator::Macd => "MACD",
            Indicator::Bb => "BB",
            Indicator::Stoch => "STOCH",
            Indicator::Atr => "ATR",
        }
    }

    /// True for indicators that read `high` and `low` in addition to the
    /// value column.
    pub fn needs_high_low(&self) -> bool {
        matches!(self, Indicator::Stoch | Indicator::Atr)
    }

    /// Columns this indicator appends, named after indicator and period.
    ///
    /// MACD columns are period-free: the fast/slow/signal period triple does
    /// not fit one suffix, and downstream nodes address `macd`/`macd_signal`
    /// directly.
    pub fn output_columns(&self, period: i64) -> Vec<String> {
        match self {
            Indicator::Sma => vec![format!("sma_{period}")],
            Indicator::Ema => vec![format!("ema_{period}")],
            Indicator::Rsi => vec![format!("rsi_{period}")],
            Indicator::Macd => vec![
                "macd".to_string(),
                "macd_signal".to_string(),
                "macd_hist".to_string(),
            ],
            Indicator::Bb => vec![
                format!("bb_upper_{period}"),
                format!("bb_middle_{period}"),
                format!("bb_lower_{period}"),
            ],
            Indicator::Stoch => vec![format!("stoch_k_{period}"), format!("stoch_d_{period}")],
            Indicator::Atr => vec![format!("atr_{period}")],
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Indicator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SMA" => Ok(Indicator::Sma),
            "EMA" => Ok(Indicator::Ema),
            "RSI" => Ok(Indicator::Rsi),
            "MACD" => Ok(Indicator::Macd),
            "BB" => Ok(Indicator::Bb),
            "STOCH" => Ok(Indicator::Stoch),
            "ATR" => Ok(Indicator::Atr),
            _ => Err(format!(
                "unknown indicator '{s}', expected one of SMA, EMA, RSI, MACD, BB, STOCH, ATR"
            )),
        }
    }
}

/// Mean of the trailing `period` values; `None` until the window fills or
/// when the window contains a null.
pub fn sma(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 {
        return out;
    }
    for i in (period - 1)..values.len() {
        let window = &values[i + 1 - period..=i];
        if window.iter().all(Option::is_some) {
            let sum: f64 = window.iter().map(|v| v.unwrap()).sum();
            out[i] = Some(sum / period as f64);
        }
    }
    out
}

/// Exponential moving average seeded with the SMA of the first window,
/// smoothing factor `k = 2 / (period + 1)`.
pub fn ema(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut prev: Option<f64> = None;
    for i in 0..values.len() {
        match (prev, values[i]) {
            (Some(p), Some(v)) => {
                let next = v * k + p * (1.0 - k);
                out[i] = Some(next);
                prev = Some(next);
            }
            (None, _) if i + 1 >= period => {
                let window = &values[i + 1 - period..=i];
                if window.iter().all(Option::is_some) {
                    let seed = window.iter().map(|v| v.unwrap()).sum::<f64>() / period as f64;
                    out[i] = Some(seed);
                    prev = Some(seed);
                }
            }
            _ => {}
        }
    }
    out
}

/// Relative strength index with Wilder smoothing.
pub fn rsi(values: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return out;
    }
    // Seed: mean gain/loss over the first `period` deltas.
    let mut gains = 0.0;
    let mut losses = 0.0;
    for i in 1..=period {
        let (Some(prev), Some(curr)) = (values[i - 1], values[i]) else {
            return out;
        };
        let delta = curr - prev;
        if delta > 0.0 {
            gains += delta;
        } else {
            losses -= delta;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let (Some(prev), Some(curr)) = (values[i - 1], values[i]) else {
            continue;
        };
        let delta = curr - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    }
}

/// MACD line, signal line, and histogram.
pub fn macd(
    values: &[Option<f64>],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let fast = ema(values, fast_period);
    let slow = ema(values, slow_period);
    let line: Vec<Option<f64>> = fast
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();
    // Signal EMA runs over the defined suffix of the MACD line.
    let defined_from = line.iter().position(Option::is_some).unwrap_or(line.len());
    let mut signal = vec![None; line.len()];
    if defined_from < line.len() {
        let suffix: Vec<Option<f64>> = line[defined_from..].to_vec();
        let suffix_signal = ema(&suffix, signal_period);
        signal[defined_from..].clone_from_slice(&suffix_signal);
    }
    let hist: Vec<Option<f64>> = line
        .iter()
        .zip(signal.iter())
        .map(|(l, s)| match (l, s) {
            (Some(l), Some(s)) => Some(l - s),
            _ => None,
        })
        .collect();
    (line, signal, hist)
}

/// Bollinger bands: `(upper, middle, lower)` at `middle ± std_dev · σ`.
pub fn bollinger(
    values: &[Option<f64>],
    period: usize,
    std_dev: f64,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let middle = sma(values, period);
    let mut upper = vec![None; values.len()];
    let mut lower = vec![None; values.len()];
    for i in 0..values.len() {
        let Some(mean) = middle[i] else { continue };
        let window = &values[i + 1 - period..=i];
        let variance = window
            .iter()
            .map(|v| {
                let v = v.unwrap();
                (v - mean) * (v - mean)
            })
            .sum::<f64>()
            / period as f64;
        let sigma = variance.sqrt();
        upper[i] = Some(mean + std_dev * sigma);
        lower[i] = Some(mean - std_dev * sigma);
    }
    (upper, middle, lower)
}

/// Stochastic oscillator: `%K` over the high/low window and its `%D` SMA.
pub fn stochastic(
    high: &[Option<f64>],
    low: &[Option<f64>],
    close: &[Option<f64>],
    k_period: usize,
    d_period: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let len = close.len();
    let mut k = vec![None; len];
    if k_period == 0 {
        return (k.clone(), k);
    }
    for i in (k_period - 1)..len {
        let range = i + 1 - k_period..=i;
        let highs = &high[range.clone()];
        let lows = &low[range];
        if highs.iter().any(Option::is_none)
            || lows.iter().any(Option::is_none)
            || close[i].is_none()
        {
            continue;
        }
        let highest = highs.iter().map(|v| v.unwrap()).fold(f64::MIN, f64::max);
        let lowest = lows.iter().map(|v| v.unwrap()).fold(f64::MAX, f64::min);
        let c = close[i].unwrap();
        k[i] = if highest == lowest {
            Some(50.0)
        } else {
            Some((c - lowest) / (highest - lowest) * 100.0)
        };
    }
    let d = sma(&k, d_period);
    (k, d)
}

/// Average true range with Wilder smoothing.
pub fn atr(
    high: &[Option<f64>],
    low: &[Option<f64>],
    close: &[Option<f64>],
    period: usize,
) -> Vec<Option<f64>> {
    let len = close.len();
    let mut out = vec![None; len];
    if period == 0 || len == 0 {
        return out;
    }
    let mut true_ranges: Vec<Option<f64>> = vec![None; len];
    for i in 0..len {
        let (Some(h), Some(l)) = (high[i], low[i]) else {
            continue;
        };
        true_ranges[i] = match (i.checked_sub(1)).and_then(|p| close[p]) {
            Some(prev_close) => Some(
                (h - l)
                    .max((h - prev_close).abs())
                    .max((l - prev_close).abs()),
            ),
            None => Some(h - l),
        };
    }
    // Seed with the SMA of the first `period` true ranges, then smooth.
    if len < period {
        return out;
    }
    let seed_window = &true_ranges[0..period];
    if seed_window.iter().any(Option::is_none) {
        return out;
    }
    let mut prev = seed_window.iter().map(|v| v.unwrap()).sum::<f64>() / period as f64;
    out[period - 1] = Some(prev);
    for i in period..len {
        let Some(tr) = true_ranges[i] else { continue };
        prev = (prev * (period as f64 - 1.0) + tr) / period as f64;
        out[i] = Some(prev);
    }
    out
}
