//! Performance metrics
//!
//! Summary statistics over a closed trade list and an equity curve. All
//! degenerate cases resolve to well-defined values: zero trades is a valid
//! (if useless) strategy outcome, not an error, and profit factor with no
//! losing trades is reported as `None` rather than +infinity.

use serde::{Deserialize, Serialize};

use crate::bars::Timeframe;
use crate::simulator::{EquityPoint, Trade};

/// Summary statistics for one backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Wins / total, 0 when no trades.
    pub win_rate: f64,
    /// (final_equity / initial_capital) - 1.
    pub total_return: f64,
    pub total_pnl: f64,
    pub final_equity: f64,
    /// Maximum peak-to-trough equity decline, non-negative fraction.
    pub max_drawdown: f64,
    /// Annualized mean/stddev of per-bar equity returns; 0 when the return
    /// series has no variance or fewer than 2 trades closed.
    pub sharpe_ratio: f64,
    /// Gross wins / gross losses; `None` when there are no losing trades.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_factor: Option<f64>,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub avg_bars_held: f64,
}

/// Derive summary metrics from the simulation output.
pub fn summarize(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    initial_capital: f64,
    timeframe: Timeframe,
) -> Metrics {
    let mut winning = 0usize;
    let mut losing = 0usize;
    let mut gross_win = 0.0f64;
    let mut gross_loss = 0.0f64;
    let mut total_pnl = 0.0f64;
    let mut total_bars = 0usize;

    for trade in trades {
        total_pnl += trade.pnl;
        total_bars += trade.bars_held;
        if trade.pnl > 0.0 {
            winning += 1;
            gross_win += trade.pnl;
        } else {
            // Breakeven trades count as losers so wins + losses always
            // partitions the trade list. They add nothing to gross loss.
            losing += 1;
            gross_loss += -trade.pnl;
        }
    }

    let n = trades.len();
    let win_rate = if n > 0 { winning as f64 / n as f64 } else { 0.0 };
    let profit_factor = if gross_loss > 0.0 {
        Some(gross_win / gross_loss)
    } else {
        None
    };
    let avg_win = if winning > 0 { gross_win / winning as f64 } else { 0.0 };
    let avg_loss = if losing > 0 { gross_loss / losing as f64 } else { 0.0 };
    let avg_bars_held = if n > 0 { total_bars as f64 / n as f64 } else { 0.0 };

    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_capital);
    let total_return = if initial_capital != 0.0 {
        final_equity / initial_capital - 1.0
    } else {
        0.0
    };

    Metrics {
        total_trades: n,
        winning_trades: winning,
        losing_trades: losing,
        win_rate,
        total_return,
        total_pnl,
        final_equity,
        max_drawdown: max_drawdown(equity_curve),
        sharpe_ratio: if n < 2 {
            0.0
        } else {
            sharpe_ratio(equity_curve, timeframe)
        },
        profit_factor,
        avg_win,
        avg_loss,
        avg_bars_held,
    }
}

/// Maximum peak-to-trough decline via a running-maximum scan.
fn max_drawdown(equity_curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd = 0.0f64;
    for point in equity_curve {
        peak = peak.max(point.equity);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - point.equity) / peak);
        }
    }
    max_dd
}

/// Mean per-bar return over its stddev, scaled by sqrt(periods per year).
/// Reported as 0 when the return series is too short or has no variance.
fn sharpe_ratio(equity_curve: &[EquityPoint], timeframe: Timeframe) -> f64 {
    let mut returns = Vec::with_capacity(equity_curve.len().saturating_sub(1));
    for w in equity_curve.windows(2) {
        if w[0].equity != 0.0 {
            returns.push(w[1].equity / w[0].equity - 1.0);
        }
    }
    if returns.len() < 2 {
        return 0.0;
    }
    let m = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / m;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (m - 1.0);
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return 0.0;
    }
    mean / stddev * timeframe.periods_per_year().sqrt()
}
