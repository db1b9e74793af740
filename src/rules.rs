//! Rule evaluation
//!
//! Evaluates a strategy's entry/exit conditions against the indicator
//! values at one bar. Entry conditions are AND-combined (conservative
//! entry), exit conditions OR-combined (responsive exit). Entry is only
//! evaluated while flat, exit only while in a position; when both could
//! fire on the same bar the exit wins and the next entry is evaluated from
//! the following bar.

use std::collections::HashMap;

use crate::bars::PriceSeries;
use crate::indicators;
use crate::strategy::{Condition, CrossDirection, StrategyRules};

/// Trading signal for one bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Enter,
    Exit,
}

/// All indicator series a rule set declares, precomputed over the full
/// price series. Indicators are pure, so computing them up front is
/// equivalent to feeding a growing window bar by bar.
pub struct IndicatorSet {
    values: HashMap<String, Vec<Option<f64>>>,
}

impl IndicatorSet {
    pub fn compute(rules: &StrategyRules, series: &PriceSeries) -> Self {
        let closes = series.closes();
        let values = rules
            .indicators
            .iter()
            .map(|spec| (spec.name.clone(), indicators::compute(spec, &closes)))
            .collect();
        Self { values }
    }

    /// Indicator value at a bar, `None` while inside the warm-up prefix.
    pub fn at(&self, name: &str, index: usize) -> Option<f64> {
        self.values.get(name).and_then(|v| v.get(index).copied()).flatten()
    }
}

/// Evaluates one rule set against precomputed indicators.
pub struct RuleEvaluator<'a> {
    rules: &'a StrategyRules,
    indicators: &'a IndicatorSet,
    closes: Vec<f64>,
}

impl<'a> RuleEvaluator<'a> {
    pub fn new(rules: &'a StrategyRules, indicators: &'a IndicatorSet, series: &PriceSeries) -> Self {
        Self {
            rules,
            indicators,
            closes: series.closes(),
        }
    }

    /// Signal at `index`. `bars_held` is `Some(n)` while a position is
    /// open, with `n` counting bars since entry.
    pub fn evaluate(&self, index: usize, bars_held: Option<usize>) -> Signal {
        match bars_held {
            Some(held) => {
                let fired = self
                    .rules
                    .exit_conditions
                    .iter()
                    .any(|c| self.condition_holds(c, index, Some(held)));
                if fired {
                    Signal::Exit
                } else {
                    Signal::None
                }
            }
            None => {
                let all_hold = self
                    .rules
                    .entry_conditions
                    .iter()
                    .all(|c| self.condition_holds(c, index, None));
                if all_hold {
                    Signal::Enter
                } else {
                    Signal::None
                }
            }
        }
    }

    /// A condition referencing an indicator still in warm-up does not hold:
    /// "undefined" means not yet evaluable, never zero.
    fn condition_holds(&self, cond: &Condition, index: usize, bars_held: Option<usize>) -> bool {
        match cond {
            Condition::Threshold { indicator, op, value } => self
                .indicators
                .at(indicator, index)
                .map(|v| op.holds(v, *value))
                .unwrap_or(false),
            Condition::PriceLevel { op, value } => op.holds(self.closes[index], *value),
            Condition::Crossover { fast, slow, direction } => {
                if index == 0 {
                    return false;
                }
                let lines = (
                    self.indicators.at(fast, index - 1),
                    self.indicators.at(slow, index - 1),
                    self.indicators.at(fast, index),
                    self.indicators.at(slow, index),
                );
                let (Some(pf), Some(ps), Some(cf), Some(cs)) = lines else {
                    return false;
                };
                match direction {
                    CrossDirection::Above => pf <= ps && cf > cs,
                    CrossDirection::Below => pf >= ps && cf < cs,
                }
            }
            Condition::HoldingPeriod { bars } => {
                bars_held.map(|held| held >= *bars).unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bars::{Bar, Timeframe};
    use crate::indicators::{IndicatorKind, IndicatorSpec};
    use crate::strategy::{CompareOp, RiskConfig};
    use chrono::{TimeZone, Utc};

    fn series_from_closes(closes: &[f64]) -> PriceSeries {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
                open: c,
                high: c,
                low: c,
                close: c,
                volume: 1.0,
            })
            .collect();
        PriceSeries::new("TEST", Timeframe::H1, bars).unwrap()
    }

    fn crossover_rules() -> StrategyRules {
        StrategyRules {
            symbol: "TEST".into(),
            timeframe: Timeframe::H1,
            indicators: vec![
                IndicatorSpec {
                    name: "fast".into(),
                    kind: IndicatorKind::Sma,
                    period: 2,
                },
                IndicatorSpec {
                    name: "slow".into(),
                    kind: IndicatorKind::Sma,
                    period: 4,
                },
            ],
            entry_conditions: vec![Condition::Crossover {
                fast: "fast".into(),
                slow: "slow".into(),
                direction: CrossDirection::Above,
            }],
            exit_conditions: vec![Condition::Crossover {
                fast: "fast".into(),
                slow: "slow".into(),
                direction: CrossDirection::Below,
            }],
            risk: RiskConfig::default(),
        }
    }

    #[test]
    fn test_warmup_suppresses_entry() {
        let series = series_from_closes(&[10.0, 9.0, 8.0, 7.0, 8.0, 10.0, 12.0]);
        let rules = crossover_rules();
        let ind = IndicatorSet::compute(&rules, &series);
        let eval = RuleEvaluator::new(&rules, &ind, &series);
        // Slow SMA(4) is undefined before index 3, so no crossover can fire.
        for i in 0..4 {
            assert_eq!(eval.evaluate(i, None), Signal::None, "bar {}", i);
        }
    }

    #[test]
    fn test_crossover_fires_once_on_the_crossing_bar() {
        // Downtrend then sharp recovery: fast SMA crosses above slow.
        let series = series_from_closes(&[10.0, 9.0, 8.0, 7.0, 7.0, 11.0, 14.0, 14.0]);
        let rules = crossover_rules();
        let ind = IndicatorSet::compute(&rules, &series);
        let eval = RuleEvaluator::new(&rules, &ind, &series);
        let fired: Vec<usize> = (0..series.len())
            .filter(|&i| eval.evaluate(i, None) == Signal::Enter)
            .collect();
        assert_eq!(fired, vec![5]);
    }

    #[test]
    fn test_entry_conditions_are_anded() {
        let mut rules = crossover_rules();
        rules.entry_conditions.push(Condition::PriceLevel {
            op: CompareOp::Gt,
            value: 1_000_000.0,
        });
        let series = series_from_closes(&[10.0, 9.0, 8.0, 7.0, 7.0, 11.0, 14.0, 14.0]);
        let ind = IndicatorSet::compute(&rules, &series);
        let eval = RuleEvaluator::new(&rules, &ind, &series);
        // The impossible price level vetoes the crossover entry.
        assert!((0..series.len()).all(|i| eval.evaluate(i, None) == Signal::None));
    }

    #[test]
    fn test_exit_conditions_are_ored() {
        let mut rules = crossover_rules();
        rules.exit_conditions.push(Condition::HoldingPeriod { bars: 1 });
        let series = series_from_closes(&[10.0, 10.0, 10.0, 10.0, 10.0]);
        let ind = IndicatorSet::compute(&rules, &series);
        let eval = RuleEvaluator::new(&rules, &ind, &series);
        // No crossover on a flat series, but the holding-period leg fires.
        assert_eq!(eval.evaluate(4, Some(1)), Signal::Exit);
        assert_eq!(eval.evaluate(4, Some(0)), Signal::None);
    }

    #[test]
    fn test_exit_not_evaluated_while_flat() {
        let rules = crossover_rules();
        let series = series_from_closes(&[10.0, 9.0, 8.0, 7.0, 6.0, 5.0]);
        let ind = IndicatorSet::compute(&rules, &series);
        let eval = RuleEvaluator::new(&rules, &ind, &series);
        // While flat only entry rules are consulted, never exits.
        assert_ne!(eval.evaluate(5, None), Signal::Exit);
    }
}
