//! Result packaging
//!
//! The value shapes other layers branch on: the optimization record with
//! its status field, and the baseline-vs-optimized comparison. The engine
//! returns these as values; persistence and transport belong to the
//! caller.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::optimizer::{GenerationStats, SearchOutcome};
use crate::simulator::BacktestResult;
use crate::strategy::ParamSpace;

/// Terminal and in-flight states of an optimization run. Serialized
/// snake_case; callers branch on these strings across the process
/// boundary. `timed_out` and `cancelled` are graceful stops that still
/// carry the best result found so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NoData,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for OptimizationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OptimizationStatus::Pending => "pending",
            OptimizationStatus::Running => "running",
            OptimizationStatus::Completed => "completed",
            OptimizationStatus::Failed => "failed",
            OptimizationStatus::NoData => "no_data",
            OptimizationStatus::Cancelled => "cancelled",
            OptimizationStatus::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// One named parameter value, in gene order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub name: String,
    pub value: f64,
}

impl ParamValue {
    /// Pair gene names with a value vector, rounding integer genes the way
    /// substitution does.
    pub fn from_space(space: &ParamSpace, values: &[f64]) -> Vec<ParamValue> {
        space
            .genes
            .iter()
            .zip(values)
            .map(|(gene, &v)| ParamValue {
                name: gene.name.clone(),
                value: gene.clamp_value(v),
            })
            .collect()
    }
}

/// Outcome of one optimization run, owned by the caller for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecord {
    pub run_id: Uuid,
    pub status: OptimizationStatus,
    pub original_params: Vec<ParamValue>,
    pub optimized_params: Vec<ParamValue>,
    pub original_score: f64,
    pub best_score: f64,
    /// (best - baseline) / |baseline|; `None` when the baseline score is 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_percent: Option<f64>,
    pub history: Vec<GenerationStats>,
    pub generations_run: usize,
    pub evaluations: usize,
}

impl OptimizationRecord {
    /// Record for a run that terminated before any generation (no data or
    /// invalid rules).
    pub fn aborted(
        run_id: Uuid,
        status: OptimizationStatus,
        original_params: Vec<ParamValue>,
    ) -> Self {
        Self {
            run_id,
            status,
            optimized_params: original_params.clone(),
            original_params,
            original_score: 0.0,
            best_score: 0.0,
            improvement_percent: None,
            history: Vec::new(),
            generations_run: 0,
            evaluations: 0,
        }
    }

    /// Package a finished search.
    pub fn from_outcome(
        run_id: Uuid,
        original_params: Vec<ParamValue>,
        original_score: f64,
        optimized_params: Vec<ParamValue>,
        outcome: SearchOutcome,
    ) -> Self {
        let improvement_percent = if original_score != 0.0 {
            Some((outcome.best_fitness - original_score) / original_score.abs() * 100.0)
        } else {
            None
        };
        Self {
            run_id,
            status: outcome.status,
            original_params,
            optimized_params,
            original_score,
            best_score: outcome.best_fitness,
            improvement_percent,
            history: outcome.history,
            generations_run: outcome.generations_run,
            evaluations: outcome.evaluations,
        }
    }
}

/// Per-metric delta between the baseline and optimized backtests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDelta {
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub total_trades: i64,
}

/// Baseline and optimized outcomes side by side, so callers can present
/// before-vs-after without recomputing either run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub baseline: BacktestResult,
    pub optimized: BacktestResult,
    pub delta: MetricsDelta,
}

/// Combine a baseline and an optimized backtest into one report.
pub fn aggregate(baseline: BacktestResult, optimized: BacktestResult) -> ComparisonReport {
    let delta = metrics_delta(&baseline.metrics, &optimized.metrics);
    ComparisonReport {
        baseline,
        optimized,
        delta,
    }
}

fn metrics_delta(baseline: &Metrics, optimized: &Metrics) -> MetricsDelta {
    MetricsDelta {
        total_return: optimized.total_return - baseline.total_return,
        sharpe_ratio: optimized.sharpe_ratio - baseline.sharpe_ratio,
        win_rate: optimized.win_rate - baseline.win_rate,
        max_drawdown: optimized.max_drawdown - baseline.max_drawdown,
        total_trades: optimized.total_trades as i64 - baseline.total_trades as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::GenerationStats;
    use crate::strategy::Gene;

    fn space() -> ParamSpace {
        ParamSpace {
            genes: vec![Gene {
                name: "rsi14.period".into(),
                value: 14.0,
                min: 2.0,
                max: 200.0,
                integer: true,
            }],
        }
    }

    fn outcome(best: f64) -> SearchOutcome {
        SearchOutcome {
            status: OptimizationStatus::Completed,
            best_genes: vec![21.0],
            best_fitness: best,
            baseline_fitness: 1.0,
            history: vec![GenerationStats {
                generation: 0,
                best_fitness: best,
                mean_fitness: best / 2.0,
            }],
            generations_run: 1,
            evaluations: 21,
        }
    }

    #[test]
    fn test_improvement_percent() {
        let record = OptimizationRecord::from_outcome(
            Uuid::nil(),
            ParamValue::from_space(&space(), &[14.0]),
            2.0,
            ParamValue::from_space(&space(), &[21.0]),
            outcome(3.0),
        );
        assert_eq!(record.improvement_percent, Some(50.0));
    }

    #[test]
    fn test_improvement_undefined_for_zero_baseline() {
        let record = OptimizationRecord::from_outcome(
            Uuid::nil(),
            ParamValue::from_space(&space(), &[14.0]),
            0.0,
            ParamValue::from_space(&space(), &[21.0]),
            outcome(3.0),
        );
        assert_eq!(record.improvement_percent, None);
    }

    #[test]
    fn test_improvement_with_negative_baseline() {
        // -2 -> -1 is a 50% improvement, not -50%.
        let record = OptimizationRecord::from_outcome(
            Uuid::nil(),
            ParamValue::from_space(&space(), &[14.0]),
            -2.0,
            ParamValue::from_space(&space(), &[21.0]),
            outcome(-1.0),
        );
        assert_eq!(record.improvement_percent, Some(50.0));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&OptimizationStatus::NoData).unwrap(),
            "\"no_data\""
        );
        assert_eq!(
            serde_json::to_string(&OptimizationStatus::TimedOut).unwrap(),
            "\"timed_out\""
        );
    }

    #[test]
    fn test_param_values_round_integer_genes() {
        let params = ParamValue::from_space(&space(), &[20.7]);
        assert_eq!(params[0].value, 21.0);
    }
}
