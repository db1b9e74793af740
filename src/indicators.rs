//! Technical indicator computation
//!
//! Pure functions over a close-price window. Each indicator returns a
//! series aligned 1:1 with the input bars; positions inside the warm-up
//! prefix (fewer than `period` bars of history) are `None`. Rule
//! evaluation treats `None` as "not yet evaluable", never as zero.

use serde::{Deserialize, Serialize};

/// Supported indicator families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Sma,
    Ema,
    Rsi,
}

impl std::fmt::Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicatorKind::Sma => write!(f, "SMA"),
            IndicatorKind::Ema => write!(f, "EMA"),
            IndicatorKind::Rsi => write!(f, "RSI"),
        }
    }
}

/// One indicator a strategy declares: a name the conditions refer to,
/// a family, and a lookback period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub name: String,
    pub kind: IndicatorKind,
    pub period: usize,
}

/// Compute an indicator series over closes. Deterministic, no state.
pub fn compute(spec: &IndicatorSpec, closes: &[f64]) -> Vec<Option<f64>> {
    match spec.kind {
        IndicatorKind::Sma => sma(closes, spec.period),
        IndicatorKind::Ema => ema(closes, spec.period),
        IndicatorKind::Rsi => rsi(closes, spec.period),
    }
}

/// Simple moving average. Defined from index `period - 1` onward.
pub fn sma(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }
    let mut sum: f64 = closes[..period].iter().sum();
    out[period - 1] = Some(sum / period as f64);
    for i in period..closes.len() {
        sum += closes[i] - closes[i - period];
        out[i] = Some(sum / period as f64);
    }
    out
}

/// Exponential moving average, seeded with the SMA of the first `period`
/// closes, then smoothed with alpha = 2 / (period + 1).
pub fn ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let mut value: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(value);
    for i in period..closes.len() {
        value = alpha * closes[i] + (1.0 - alpha) * value;
        out[i] = Some(value);
    }
    out
}

/// Relative strength index with Wilder smoothing. Defined from index
/// `period` onward (the first delta consumes one bar).
pub fn rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() <= period {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }
    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        // No losses in the window: fully overbought (flat windows included).
        if avg_gain == 0.0 {
            return 50.0;
        }
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}
