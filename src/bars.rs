//! OHLCV bars and price series
//!
//! The engine consumes an ordered series of historical bars produced by an
//! external data provider. Bars are immutable once constructed; the series
//! constructor enforces strictly increasing timestamps (gaps from
//! non-trading periods are fine, silent reordering is not).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// One OHLCV observation for a fixed time interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bar interval of a price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// Bar periods in one trading year, used to annualize the Sharpe ratio.
    /// Intraday timeframes assume 252 trading days x 6.5 RTH hours.
    pub fn periods_per_year(&self) -> f64 {
        match self {
            Timeframe::M1 => 252.0 * 390.0,
            Timeframe::M5 => 252.0 * 78.0,
            Timeframe::M15 => 252.0 * 26.0,
            Timeframe::M30 => 252.0 * 13.0,
            Timeframe::H1 => 252.0 * 6.5,
            Timeframe::H4 => 252.0 * 1.625,
            Timeframe::D1 => 252.0,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        };
        write!(f, "{}", s)
    }
}

/// Ordered historical bars for one symbol/timeframe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSeries {
    pub symbol: String,
    pub timeframe: Timeframe,
    bars: Vec<Bar>,
}

impl PriceSeries {
    /// Build a series, validating timestamp order. Gaps are permitted.
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        bars: Vec<Bar>,
    ) -> Result<Self, EngineError> {
        for w in bars.windows(2) {
            if w[1].timestamp <= w[0].timestamp {
                return Err(EngineError::DataUnavailable(format!(
                    "bars out of order at {}: {} followed by {}",
                    w[0].timestamp, w[0].timestamp, w[1].timestamp
                )));
            }
        }
        Ok(Self {
            symbol: symbol.into(),
            timeframe,
            bars,
        })
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }
}
