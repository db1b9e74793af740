//! Backtest simulation
//!
//! Steps through a price series bar by bar, evaluating the rule set and
//! maintaining a single open position (no pyramiding). Protective stop/take
//! levels are checked before rule-based exits; a bar that gaps through its
//! stop still fills at the configured level so risk accounting stays
//! deterministic. The run is a pure function of its inputs: the same rules
//! and series always produce the same trade list and equity curve.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bars::{Bar, PriceSeries};
use crate::error::EngineError;
use crate::metrics::{self, Metrics};
use crate::rules::{IndicatorSet, RuleEvaluator, Signal};
use crate::strategy::StrategyRules;

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// A rule-based exit condition fired.
    Signal,
    StopLoss,
    TakeProfit,
    /// Force-closed at the final bar so every run ends flat.
    EndOfData,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Signal => write!(f, "signal"),
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::EndOfData => write!(f, "end_of_data"),
        }
    }
}

/// One completed round trip. Immutable; appended in time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub pnl: f64,
    /// Fractional return on the position notional.
    pub pnl_pct: f64,
    pub bars_held: usize,
    pub exit_reason: ExitReason,
}

/// Account value at one bar: realized pnl plus any open position marked at
/// the bar close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

/// Output of one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub metrics: Metrics,
}

/// Open position state. Exists only during simulation.
#[derive(Debug, Clone)]
struct Position {
    entry_index: usize,
    entry_time: DateTime<Utc>,
    entry_price: f64,
    size: f64,
    stop_price: Option<f64>,
    take_profit_price: Option<f64>,
}

/// Bar-by-bar backtest engine.
#[derive(Debug, Clone)]
pub struct Backtester {
    initial_capital: f64,
}

impl Backtester {
    pub fn new(initial_capital: f64) -> Self {
        Self { initial_capital }
    }

    /// Run the rule set over the series, returning the closed trade list,
    /// the per-bar equity curve and summary metrics.
    pub fn run(
        &self,
        rules: &StrategyRules,
        series: &PriceSeries,
    ) -> Result<BacktestResult, EngineError> {
        if series.is_empty() {
            return Err(EngineError::DataUnavailable(format!(
                "empty price series for {}",
                series.symbol
            )));
        }
        rules.validate()?;
        let lookback = rules.max_lookback();
        if lookback > series.len() {
            return Err(EngineError::InvalidStrategyRules(format!(
                "indicators need {} bars but the series has {}",
                lookback,
                series.len()
            )));
        }
        for bar in series.bars() {
            if !(bar.close.is_finite() && bar.close > 0.0 && bar.high >= bar.low) {
                return Err(EngineError::DataUnavailable(format!(
                    "malformed bar at {}",
                    bar.timestamp
                )));
            }
        }

        let indicators = IndicatorSet::compute(rules, series);
        let evaluator = RuleEvaluator::new(rules, &indicators, series);
        let bars = series.bars();
        let last = bars.len() - 1;

        let mut equity = self.initial_capital;
        let mut position: Option<Position> = None;
        let mut trades: Vec<Trade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(bars.len());

        for (i, bar) in bars.iter().enumerate() {
            let mut exited_this_bar = false;

            if let Some(pos) = position.take() {
                let bars_held = i - pos.entry_index;
                let exit = protective_exit(&pos, bar).or_else(|| {
                    match evaluator.evaluate(i, Some(bars_held)) {
                        Signal::Exit => Some((bar.close, ExitReason::Signal)),
                        _ => None,
                    }
                });

                match exit {
                    Some((price, reason)) => {
                        equity += close_trade(&mut trades, &pos, bar, price, reason, bars_held);
                        exited_this_bar = true;
                    }
                    None if i == last => {
                        // Still open at the end of data: force-close at the
                        // last available close.
                        equity += close_trade(
                            &mut trades,
                            &pos,
                            bar,
                            bar.close,
                            ExitReason::EndOfData,
                            bars_held,
                        );
                    }
                    None => position = Some(pos),
                }
            }

            // Exit precedence: after a same-bar exit the next entry is
            // evaluated from the following bar. No entries on the final bar
            // either, there is nothing left to exit on.
            if position.is_none()
                && !exited_this_bar
                && i < last
                && evaluator.evaluate(i, None) == Signal::Enter
            {
                let size = equity * rules.risk.position_size_pct / 100.0 / bar.close;
                let stop_price = rules
                    .risk
                    .stop_loss_pct
                    .map(|p| bar.close * (1.0 - p / 100.0));
                let take_profit_price = rules
                    .risk
                    .take_profit_pct
                    .map(|p| bar.close * (1.0 + p / 100.0));
                debug!(
                    bar = i,
                    price = bar.close,
                    size,
                    "entering long position"
                );
                position = Some(Position {
                    entry_index: i,
                    entry_time: bar.timestamp,
                    entry_price: bar.close,
                    size,
                    stop_price,
                    take_profit_price,
                });
            }

            let unrealized = position
                .as_ref()
                .map(|p| p.size * (bar.close - p.entry_price))
                .unwrap_or(0.0);
            equity_curve.push(EquityPoint {
                timestamp: bar.timestamp,
                equity: equity + unrealized,
            });
        }

        let metrics = metrics::summarize(
            &trades,
            &equity_curve,
            self.initial_capital,
            series.timeframe,
        );
        Ok(BacktestResult {
            trades,
            equity_curve,
            metrics,
        })
    }
}

/// Check stop/take-profit breach for the bar. The stop is checked first:
/// when both levels are breached within one bar the conservative fill wins.
/// Fills happen at the configured level even if the bar gapped through it.
fn protective_exit(pos: &Position, bar: &Bar) -> Option<(f64, ExitReason)> {
    if let Some(stop) = pos.stop_price {
        if bar.low <= stop {
            return Some((stop, ExitReason::StopLoss));
        }
    }
    if let Some(target) = pos.take_profit_price {
        if bar.high >= target {
            return Some((target, ExitReason::TakeProfit));
        }
    }
    None
}

fn close_trade(
    trades: &mut Vec<Trade>,
    pos: &Position,
    bar: &Bar,
    exit_price: f64,
    reason: ExitReason,
    bars_held: usize,
) -> f64 {
    let pnl = pos.size * (exit_price - pos.entry_price);
    debug!(
        entry = pos.entry_price,
        exit = exit_price,
        pnl,
        reason = %reason,
        "closing position"
    );
    trades.push(Trade {
        entry_time: pos.entry_time,
        exit_time: bar.timestamp,
        entry_price: pos.entry_price,
        exit_price,
        size: pos.size,
        pnl,
        pnl_pct: exit_price / pos.entry_price - 1.0,
        bars_held,
        exit_reason: reason,
    });
    pnl
}
