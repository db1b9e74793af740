//! Strategy rule set
//!
//! The rule set arrives from an upstream parser as loosely structured JSON.
//! This module is the ingestion boundary: conditions are a closed tagged
//! enum, unknown variants and fields are rejected at deserialization time
//! rather than evaluated dynamically. It also exposes the numeric parameter
//! space the optimizer searches: rule structure stays fixed, only periods,
//! thresholds and risk values are tunable genes.

use serde::{Deserialize, Serialize};

use crate::bars::Timeframe;
use crate::error::EngineError;
use crate::indicators::{IndicatorKind, IndicatorSpec};

/// Comparison operator for threshold-style conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
        }
    }
}

/// Direction of a crossover condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossDirection {
    /// Fast line crosses above the slow line.
    Above,
    /// Fast line crosses below the slow line.
    Below,
}

/// One entry/exit predicate. Closed variant set: anything outside it is
/// rejected when the rule set is ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Condition {
    /// Indicator value compared against a numeric level.
    Threshold {
        indicator: String,
        op: CompareOp,
        value: f64,
    },
    /// Fast indicator crossing the slow indicator between the previous
    /// bar and this one.
    Crossover {
        fast: String,
        slow: String,
        direction: CrossDirection,
    },
    /// Close price compared against a numeric level.
    PriceLevel { op: CompareOp, value: f64 },
    /// Holds once the open position has been held at least `bars` bars.
    /// Exit-side only.
    HoldingPeriod { bars: usize },
}

/// Risk management settings. Stop and target are percent distances from the
/// entry price; when both are breached within one bar the stop fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit_pct: Option<f64>,
    /// Percent of current equity committed per trade.
    pub position_size_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: None,
            take_profit_pct: None,
            position_size_pct: 100.0,
        }
    }
}

/// A complete strategy rule set, produced upstream and read-only here.
/// Entry conditions are AND-combined; exit conditions are OR-combined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyRules {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub indicators: Vec<IndicatorSpec>,
    pub entry_conditions: Vec<Condition>,
    pub exit_conditions: Vec<Condition>,
    #[serde(default)]
    pub risk: RiskConfig,
}

impl StrategyRules {
    /// Parse a rule set from upstream JSON, rejecting unknown shapes.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let rules: StrategyRules = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidStrategyRules(e.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    /// Check internal consistency: every condition references a declared
    /// indicator, periods and risk values are sane.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.entry_conditions.is_empty() {
            return Err(EngineError::InvalidStrategyRules(
                "strategy has no entry conditions".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for spec in &self.indicators {
            if spec.period < 1 {
                return Err(EngineError::InvalidStrategyRules(format!(
                    "indicator '{}' has period 0",
                    spec.name
                )));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(EngineError::InvalidStrategyRules(format!(
                    "duplicate indicator name '{}'",
                    spec.name
                )));
            }
        }

        let check_ref = |name: &str| -> Result<(), EngineError> {
            if names.contains(name) {
                Ok(())
            } else {
                Err(EngineError::InvalidStrategyRules(format!(
                    "condition references undeclared indicator '{}'",
                    name
                )))
            }
        };
        for cond in self.entry_conditions.iter().chain(&self.exit_conditions) {
            match cond {
                Condition::Threshold { indicator, .. } => check_ref(indicator)?,
                Condition::Crossover { fast, slow, .. } => {
                    check_ref(fast)?;
                    check_ref(slow)?;
                }
                Condition::PriceLevel { .. } => {}
                Condition::HoldingPeriod { bars } => {
                    if *bars == 0 {
                        return Err(EngineError::InvalidStrategyRules(
                            "holding_period of 0 bars".into(),
                        ));
                    }
                }
            }
        }
        for cond in &self.entry_conditions {
            if matches!(cond, Condition::HoldingPeriod { .. }) {
                return Err(EngineError::InvalidStrategyRules(
                    "holding_period is only valid as an exit condition".into(),
                ));
            }
        }

        if !(0.0 < self.risk.position_size_pct && self.risk.position_size_pct <= 100.0) {
            return Err(EngineError::InvalidStrategyRules(format!(
                "position_size_pct {} outside (0, 100]",
                self.risk.position_size_pct
            )));
        }
        for (label, pct) in [
            ("stop_loss_pct", self.risk.stop_loss_pct),
            ("take_profit_pct", self.risk.take_profit_pct),
        ] {
            if let Some(p) = pct {
                if p <= 0.0 {
                    return Err(EngineError::InvalidStrategyRules(format!(
                        "{} must be positive, got {}",
                        label, p
                    )));
                }
            }
        }

        Ok(())
    }

    /// Longest lookback any declared indicator needs. RSI consumes one
    /// extra bar for its first delta.
    pub fn max_lookback(&self) -> usize {
        self.indicators
            .iter()
            .map(|s| match s.kind {
                IndicatorKind::Rsi => s.period + 1,
                _ => s.period,
            })
            .max()
            .unwrap_or(0)
    }

    fn indicator_kind(&self, name: &str) -> Option<IndicatorKind> {
        self.indicators.iter().find(|s| s.name == name).map(|s| s.kind)
    }

    /// Extract the tunable numeric genes in a fixed order: indicator
    /// periods, entry thresholds, exit thresholds, risk values.
    pub fn parameter_space(&self) -> ParamSpace {
        let mut genes = Vec::new();

        for spec in &self.indicators {
            genes.push(Gene {
                name: format!("{}.period", spec.name),
                value: spec.period as f64,
                min: 2.0,
                max: 200.0,
                integer: true,
            });
        }

        let push_conditions = |conds: &[Condition], side: &str, genes: &mut Vec<Gene>| {
            for (i, cond) in conds.iter().enumerate() {
                match cond {
                    Condition::Threshold { indicator, value, .. } => {
                        let (min, max) = match self.indicator_kind(indicator) {
                            Some(IndicatorKind::Rsi) => (0.0, 100.0),
                            _ => level_bounds(*value),
                        };
                        genes.push(Gene {
                            name: format!("{}[{}].value", side, i),
                            value: *value,
                            min,
                            max,
                            integer: false,
                        });
                    }
                    Condition::PriceLevel { value, .. } => {
                        let (min, max) = level_bounds(*value);
                        genes.push(Gene {
                            name: format!("{}[{}].value", side, i),
                            value: *value,
                            min,
                            max,
                            integer: false,
                        });
                    }
                    Condition::HoldingPeriod { bars } => {
                        genes.push(Gene {
                            name: format!("{}[{}].bars", side, i),
                            value: *bars as f64,
                            min: 1.0,
                            max: 500.0,
                            integer: true,
                        });
                    }
                    Condition::Crossover { .. } => {}
                }
            }
        };
        push_conditions(&self.entry_conditions, "entry", &mut genes);
        push_conditions(&self.exit_conditions, "exit", &mut genes);

        if let Some(p) = self.risk.stop_loss_pct {
            genes.push(Gene {
                name: "risk.stop_loss_pct".into(),
                value: p,
                min: 0.1,
                max: 50.0,
                integer: false,
            });
        }
        if let Some(p) = self.risk.take_profit_pct {
            genes.push(Gene {
                name: "risk.take_profit_pct".into(),
                value: p,
                min: 0.1,
                max: 50.0,
                integer: false,
            });
        }
        genes.push(Gene {
            name: "risk.position_size_pct".into(),
            value: self.risk.position_size_pct,
            min: 1.0,
            max: 100.0,
            integer: false,
        });

        ParamSpace { genes }
    }

    /// Substitute a gene vector (same order as `parameter_space`) back into
    /// a copy of the rules. Integer genes are rounded; all genes clamped to
    /// their bounds.
    pub fn with_parameters(&self, values: &[f64]) -> Result<StrategyRules, EngineError> {
        let space = self.parameter_space();
        if values.len() != space.genes.len() {
            return Err(EngineError::InvalidStrategyRules(format!(
                "parameter vector length {} != expected {}",
                values.len(),
                space.genes.len()
            )));
        }

        let mut rules = self.clone();
        let mut it = space
            .genes
            .iter()
            .zip(values)
            .map(|(g, &v)| g.clamp_value(v));

        for spec in &mut rules.indicators {
            spec.period = it.next().unwrap_or(spec.period as f64) as usize;
        }
        for cond in rules
            .entry_conditions
            .iter_mut()
            .chain(rules.exit_conditions.iter_mut())
        {
            match cond {
                Condition::Threshold { value, .. } | Condition::PriceLevel { value, .. } => {
                    *value = it.next().unwrap_or(*value);
                }
                Condition::HoldingPeriod { bars } => {
                    *bars = it.next().unwrap_or(*bars as f64) as usize;
                }
                Condition::Crossover { .. } => {}
            }
        }
        if let Some(p) = rules.risk.stop_loss_pct.as_mut() {
            *p = it.next().unwrap_or(*p);
        }
        if let Some(p) = rules.risk.take_profit_pct.as_mut() {
            *p = it.next().unwrap_or(*p);
        }
        rules.risk.position_size_pct = it.next().unwrap_or(rules.risk.position_size_pct);

        rules.validate()?;
        Ok(rules)
    }
}

/// Search bounds for a price-like level: +/-50% around the baseline.
fn level_bounds(value: f64) -> (f64, f64) {
    if value > 0.0 {
        (value * 0.5, value * 1.5)
    } else if value < 0.0 {
        (value * 1.5, value * 0.5)
    } else {
        (-1.0, 1.0)
    }
}

/// One tunable numeric parameter with its search domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gene {
    pub name: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    /// Rounded to the nearest integer when substituted back.
    pub integer: bool,
}

impl Gene {
    pub fn clamp_value(&self, v: f64) -> f64 {
        let v = v.clamp(self.min, self.max);
        if self.integer {
            v.round()
        } else {
            v
        }
    }
}

/// The ordered set of genes the optimizer searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpace {
    pub genes: Vec<Gene>,
}

impl ParamSpace {
    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    /// Baseline values in gene order.
    pub fn baseline(&self) -> Vec<f64> {
        self.genes.iter().map(|g| g.value).collect()
    }
}
