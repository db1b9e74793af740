//! Engine error taxonomy
//!
//! Callers across a process boundary branch on the status field of the
//! returned record, so the error set is closed and maps 1:1 onto terminal
//! statuses.

use thiserror::Error;

/// Errors produced by the backtest engine and optimizer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// No or insufficient price history for the requested symbol/timeframe.
    #[error("no price data available: {0}")]
    DataUnavailable(String),

    /// Malformed or under-specified strategy rule set.
    #[error("invalid strategy rules: {0}")]
    InvalidStrategyRules(String),

    /// Unexpected failure mid-simulation for a specific parameter set.
    #[error("simulation failed: {0}")]
    Simulation(String),

    /// Optimization wall-clock budget exhausted.
    #[error("optimization timed out")]
    Timeout,

    /// Optimization cancelled by the caller.
    #[error("optimization cancelled")]
    Cancelled,
}
