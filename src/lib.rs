//! Backtest simulation engine + evolutionary parameter optimizer
//!
//! Pure computation over inputs the caller provides:
//! - Indicator computation over OHLCV bars
//! - Rule evaluation (AND-entry / OR-exit with protective stops)
//! - Bar-by-bar backtest simulation producing trades + equity curve
//! - Summary metrics (return, win rate, drawdown, Sharpe, profit factor)
//! - Population-based search over the strategy's numeric parameters
//! - Baseline-vs-optimized result packaging
//!
//! The engine holds no shared mutable state: simulations are deterministic
//! functions of their inputs, and optimizer runs are reproducible for a
//! fixed seed.

pub mod bars;
pub mod error;
pub mod indicators;
pub mod metrics;
pub mod optimizer;
pub mod report;
pub mod rules;
pub mod simulator;
pub mod strategy;

// Re-export commonly used types
pub use bars::{Bar, PriceSeries, Timeframe};
pub use error::EngineError;
pub use indicators::{IndicatorKind, IndicatorSpec};
pub use metrics::Metrics;
pub use optimizer::{
    optimize_strategy, BacktestFitness, CancelToken, Fitness, GenerationStats, GeneticOptimizer,
    Objective, OptimizerConfig,
};
pub use report::{aggregate, ComparisonReport, OptimizationRecord, OptimizationStatus, ParamValue};
pub use rules::{RuleEvaluator, Signal};
pub use simulator::{BacktestResult, Backtester, EquityPoint, ExitReason, Trade};
pub use strategy::{CompareOp, Condition, CrossDirection, RiskConfig, StrategyRules};
