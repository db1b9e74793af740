//! Evolutionary parameter search
//!
//! Population-based search over a strategy's numeric genes with the
//! backtest-then-score pipeline as the fitness function. Classic
//! evolutionary strategy: elitism, tournament selection, per-gene blend
//! crossover and bounded Gaussian mutation. Candidate evaluations within a
//! generation are independent and run on the rayon pool; all stochastic
//! steps draw from one seeded RNG in a fixed sequential order, so a fixed
//! seed reproduces the search exactly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bars::PriceSeries;
use crate::error::EngineError;
use crate::metrics::Metrics;
use crate::report::{OptimizationRecord, OptimizationStatus, ParamValue};
use crate::simulator::Backtester;
use crate::strategy::{ParamSpace, StrategyRules};

/// Fitness assigned to a candidate whose simulation failed. Finite so that
/// population mean fitness stays finite in the history.
pub const WORST_FITNESS: f64 = -1e12;

/// Finite stand-in for an undefined profit factor (no losing trades).
const PROFIT_FACTOR_CAP: f64 = 1e3;

/// Improvement below this does not reset the plateau counter.
const PLATEAU_EPSILON: f64 = 1e-9;

/// Objective the search maximizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    Sharpe,
    TotalReturn,
    WinRate,
    ProfitFactor,
    /// Weighted sum of sub-objectives.
    Weighted(Vec<(f64, Objective)>),
}

impl Objective {
    /// Scalar objective value for one metric set. Always finite.
    pub fn score(&self, metrics: &Metrics) -> f64 {
        match self {
            Objective::Sharpe => metrics.sharpe_ratio,
            Objective::TotalReturn => metrics.total_return,
            Objective::WinRate => metrics.win_rate,
            Objective::ProfitFactor => match metrics.profit_factor {
                Some(pf) => pf.min(PROFIT_FACTOR_CAP),
                // No losers: excellent when it actually traded, worthless
                // when it never did.
                None if metrics.winning_trades > 0 => PROFIT_FACTOR_CAP,
                None => 0.0,
            },
            Objective::Weighted(terms) => terms
                .iter()
                .map(|(weight, objective)| weight * objective.score(metrics))
                .sum(),
        }
    }
}

/// Pluggable fitness function. The production implementation substitutes
/// genes into the strategy rules and runs the simulator; tests plug in
/// analytic functions.
pub trait Fitness: Sync {
    fn evaluate(&self, genes: &[f64]) -> Result<f64, EngineError>;
}

/// Backtest-driven fitness: genes -> rules -> simulate -> objective.
pub struct BacktestFitness<'a> {
    rules: &'a StrategyRules,
    series: &'a PriceSeries,
    engine: Backtester,
    objective: Objective,
}

impl<'a> BacktestFitness<'a> {
    pub fn new(
        rules: &'a StrategyRules,
        series: &'a PriceSeries,
        initial_capital: f64,
        objective: Objective,
    ) -> Self {
        Self {
            rules,
            series,
            engine: Backtester::new(initial_capital),
            objective,
        }
    }
}

impl Fitness for BacktestFitness<'_> {
    fn evaluate(&self, genes: &[f64]) -> Result<f64, EngineError> {
        let candidate_rules = self.rules.with_parameters(genes)?;
        let result = self.engine.run(&candidate_rules, self.series)?;
        Ok(self.objective.score(&result.metrics))
    }
}

/// Search configuration.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub objective: Objective,
    pub population_size: usize,
    pub generations: usize,
    /// Fraction of the population carried forward unmodified each
    /// generation. At least one elite is always kept.
    pub elite_fraction: f64,
    pub tournament_size: usize,
    /// Per-gene probability of Gaussian mutation after crossover.
    pub mutation_probability: f64,
    /// Mutation stddev as a fraction of each gene's bound span.
    pub mutation_scale: f64,
    /// Stop early after this many generations without best-fitness
    /// improvement.
    pub plateau_generations: Option<usize>,
    /// Wall-clock budget, polled at generation boundaries.
    pub timeout: Option<Duration>,
    /// Fixed seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            objective: Objective::Sharpe,
            population_size: 30,
            generations: 25,
            elite_fraction: 0.2,
            tournament_size: 3,
            mutation_probability: 0.3,
            mutation_scale: 0.15,
            plateau_generations: Some(8),
            timeout: None,
            seed: None,
        }
    }
}

/// Caller-held cancellation flag, polled once per generation. Mid-generation
/// work always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One parameter vector under evaluation.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub genes: Vec<f64>,
    pub fitness: Option<f64>,
}

/// Per-generation summary appended to the search history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub best_fitness: f64,
    pub mean_fitness: f64,
}

/// Raw search outcome, before packaging into an `OptimizationRecord`.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub status: OptimizationStatus,
    pub best_genes: Vec<f64>,
    pub best_fitness: f64,
    pub baseline_fitness: f64,
    pub history: Vec<GenerationStats>,
    pub generations_run: usize,
    pub evaluations: usize,
}

/// Evolutionary optimizer over a fixed rule structure.
pub struct GeneticOptimizer {
    config: OptimizerConfig,
}

impl GeneticOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Run the search. Never panics on candidate failures: a failed
    /// evaluation scores `WORST_FITNESS` and the search continues.
    /// Cancellation and the wall-clock deadline are honored at generation
    /// boundaries only; a graceful stop still returns the best found so
    /// far.
    pub fn run(
        &self,
        space: &ParamSpace,
        fitness: &dyn Fitness,
        cancel: &CancelToken,
    ) -> SearchOutcome {
        let cfg = &self.config;
        let seed = cfg.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let deadline = cfg.timeout.map(|t| Instant::now() + t);
        let mut evaluations = 0usize;

        let baseline = space.baseline();
        let baseline_fitness = match fitness.evaluate(&baseline) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "baseline evaluation failed");
                WORST_FITNESS
            }
        };
        evaluations += 1;

        let mut best_genes = baseline.clone();
        let mut best_fitness = baseline_fitness;
        let mut history: Vec<GenerationStats> = Vec::new();
        let mut stall = 0usize;
        let mut generations_run = 0usize;
        let mut status = OptimizationStatus::Completed;

        if space.is_empty() || cfg.population_size < 2 || cfg.generations == 0 {
            return SearchOutcome {
                status,
                best_genes,
                best_fitness,
                baseline_fitness,
                history,
                generations_run,
                evaluations,
            };
        }

        // Generation 0: the baseline plus N-1 bounded-Gaussian perturbations.
        let mut population: Vec<Candidate> = Vec::with_capacity(cfg.population_size);
        population.push(Candidate {
            genes: baseline.clone(),
            fitness: Some(baseline_fitness),
        });
        for _ in 1..cfg.population_size {
            population.push(Candidate {
                genes: self.perturb(space, &baseline, &mut rng),
                fitness: None,
            });
        }

        for generation in 0..cfg.generations {
            if cancel.is_cancelled() {
                info!(generation, "optimization cancelled");
                status = OptimizationStatus::Cancelled;
                break;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    info!(generation, "optimization wall-clock budget exhausted");
                    status = OptimizationStatus::TimedOut;
                    break;
                }
            }

            // Evaluate. Candidates are independent; failures are contained.
            evaluations += population.iter().filter(|c| c.fitness.is_none()).count();
            population.par_iter_mut().for_each(|candidate| {
                if candidate.fitness.is_none() {
                    let score = match fitness.evaluate(&candidate.genes) {
                        Ok(f) if f.is_finite() => f,
                        Ok(_) => WORST_FITNESS,
                        Err(e) => {
                            debug!(error = %e, "candidate evaluation failed");
                            WORST_FITNESS
                        }
                    };
                    candidate.fitness = Some(score);
                }
            });

            population.sort_by(|a, b| {
                b.fitness
                    .partial_cmp(&a.fitness)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            generations_run += 1;

            let gen_best = population[0].fitness.unwrap_or(WORST_FITNESS);
            if gen_best > best_fitness + PLATEAU_EPSILON {
                best_fitness = gen_best;
                best_genes = population[0].genes.clone();
                stall = 0;
            } else {
                stall += 1;
            }

            let mean_fitness = population
                .iter()
                .map(|c| c.fitness.unwrap_or(WORST_FITNESS))
                .sum::<f64>()
                / population.len() as f64;
            history.push(GenerationStats {
                generation,
                best_fitness,
                mean_fitness,
            });
            info!(generation, best = best_fitness, mean = mean_fitness, "generation complete");

            if let Some(limit) = cfg.plateau_generations {
                if stall >= limit {
                    info!(generation, stall, "fitness plateau, stopping early");
                    break;
                }
            }
            if generation + 1 == cfg.generations {
                break;
            }

            population = self.reproduce(space, population, &mut rng);
        }

        SearchOutcome {
            status,
            best_genes,
            best_fitness,
            baseline_fitness,
            history,
            generations_run,
            evaluations,
        }
    }

    /// Independent bounded-Gaussian perturbation of every gene.
    fn perturb(&self, space: &ParamSpace, base: &[f64], rng: &mut StdRng) -> Vec<f64> {
        space
            .genes
            .iter()
            .zip(base)
            .map(|(gene, &value)| {
                let sigma = (gene.max - gene.min) * self.config.mutation_scale;
                let noise = Normal::new(0.0, sigma)
                    .map(|d| d.sample(rng))
                    .unwrap_or(0.0);
                (value + noise).clamp(gene.min, gene.max)
            })
            .collect()
    }

    /// Keep the elite slice unmodified and refill the rest via tournament
    /// selection, per-gene blend crossover and Gaussian mutation.
    fn reproduce(
        &self,
        space: &ParamSpace,
        ranked: Vec<Candidate>,
        rng: &mut StdRng,
    ) -> Vec<Candidate> {
        let cfg = &self.config;
        let pop = ranked.len();
        let elite_count = ((cfg.elite_fraction * pop as f64).round() as usize).clamp(1, pop);

        let mut next: Vec<Candidate> = ranked[..elite_count].to_vec();
        while next.len() < pop {
            let a = self.tournament(&ranked, rng);
            let b = self.tournament(&ranked, rng);
            let mut child: Vec<f64> = a
                .genes
                .iter()
                .zip(&b.genes)
                .map(|(&ga, &gb)| {
                    let r: f64 = rng.gen();
                    ga + r * (gb - ga)
                })
                .collect();
            for (gene, value) in space.genes.iter().zip(child.iter_mut()) {
                if rng.gen::<f64>() < cfg.mutation_probability {
                    let sigma = (gene.max - gene.min) * cfg.mutation_scale;
                    let noise = Normal::new(0.0, sigma)
                        .map(|d| d.sample(rng))
                        .unwrap_or(0.0);
                    *value = (*value + noise).clamp(gene.min, gene.max);
                }
            }
            next.push(Candidate {
                genes: child,
                fitness: None,
            });
        }
        next
    }

    /// Best of `tournament_size` uniform draws. The population is ranked
    /// descending, so the lowest drawn index wins.
    fn tournament<'p>(&self, ranked: &'p [Candidate], rng: &mut StdRng) -> &'p Candidate {
        let k = self.config.tournament_size.max(1);
        let mut winner = rng.gen_range(0..ranked.len());
        for _ in 1..k {
            winner = winner.min(rng.gen_range(0..ranked.len()));
        }
        &ranked[winner]
    }
}

/// Full optimization entry point: baseline backtest, evolutionary search,
/// packaged record. `no_data` and `failed` terminate before any generation
/// runs, as the status contract requires.
pub fn optimize_strategy(
    rules: &StrategyRules,
    series: &PriceSeries,
    initial_capital: f64,
    config: OptimizerConfig,
    cancel: &CancelToken,
) -> OptimizationRecord {
    let run_id = Uuid::new_v4();
    let space = rules.parameter_space();
    let original_params = ParamValue::from_space(&space, &space.baseline());

    let baseline_run = Backtester::new(initial_capital).run(rules, series);
    let baseline_metrics = match baseline_run {
        Ok(result) => result.metrics,
        Err(e) => {
            let status = match e {
                EngineError::DataUnavailable(_) => OptimizationStatus::NoData,
                _ => OptimizationStatus::Failed,
            };
            warn!(error = %e, "baseline backtest failed, optimization not started");
            return OptimizationRecord::aborted(run_id, status, original_params);
        }
    };
    let original_score = config.objective.score(&baseline_metrics);

    let fitness = BacktestFitness::new(rules, series, initial_capital, config.objective.clone());
    let optimizer = GeneticOptimizer::new(config);
    let outcome = optimizer.run(&space, &fitness, cancel);

    let optimized_params = ParamValue::from_space(&space, &outcome.best_genes);
    OptimizationRecord::from_outcome(run_id, original_params, original_score, optimized_params, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Gene;

    /// Analytic single-gene fitness peaking at 42.
    struct Quadratic;

    impl Fitness for Quadratic {
        fn evaluate(&self, genes: &[f64]) -> Result<f64, EngineError> {
            Ok(-(genes[0] - 42.0).powi(2))
        }
    }

    fn one_gene_space(baseline: f64) -> ParamSpace {
        ParamSpace {
            genes: vec![Gene {
                name: "gene".into(),
                value: baseline,
                min: 0.0,
                max: 100.0,
                integer: false,
            }],
        }
    }

    fn config(population: usize, generations: usize, seed: u64) -> OptimizerConfig {
        OptimizerConfig {
            objective: Objective::TotalReturn,
            population_size: population,
            generations,
            elite_fraction: 0.2,
            tournament_size: 3,
            mutation_probability: 0.5,
            mutation_scale: 0.2,
            plateau_generations: None,
            timeout: None,
            seed: Some(seed),
        }
    }

    #[test]
    fn test_quadratic_converges_in_five_generations() {
        let optimizer = GeneticOptimizer::new(config(20, 5, 42));
        let outcome = optimizer.run(&one_gene_space(10.0), &Quadratic, &CancelToken::new());
        assert_eq!(outcome.status, OptimizationStatus::Completed);
        assert!(
            (outcome.best_genes[0] - 42.0).abs() < 10.0,
            "gene {} not near 42",
            outcome.best_genes[0]
        );
        assert!(outcome.best_fitness > -100.0, "fitness {}", outcome.best_fitness);
        assert!(outcome.best_fitness > outcome.baseline_fitness);
    }

    #[test]
    fn test_quadratic_converges_tightly_with_budget() {
        let optimizer = GeneticOptimizer::new(config(30, 40, 7));
        let outcome = optimizer.run(&one_gene_space(5.0), &Quadratic, &CancelToken::new());
        assert!(
            (outcome.best_genes[0] - 42.0).abs() < 2.0,
            "gene {} not near 42",
            outcome.best_genes[0]
        );
        assert!(outcome.best_fitness > -4.0);
    }

    #[test]
    fn test_elitism_keeps_best_fitness_monotone() {
        let optimizer = GeneticOptimizer::new(config(16, 20, 99));
        let outcome = optimizer.run(&one_gene_space(90.0), &Quadratic, &CancelToken::new());
        for w in outcome.history.windows(2) {
            assert!(
                w[1].best_fitness >= w[0].best_fitness,
                "best fitness regressed: {:?} -> {:?}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_fixed_seed_reproduces_search_exactly() {
        let space = one_gene_space(10.0);
        let a = GeneticOptimizer::new(config(20, 10, 1234)).run(&space, &Quadratic, &CancelToken::new());
        let b = GeneticOptimizer::new(config(20, 10, 1234)).run(&space, &Quadratic, &CancelToken::new());
        assert_eq!(a.best_genes, b.best_genes);
        assert_eq!(a.best_fitness, b.best_fitness);
        assert_eq!(a.history, b.history);
        assert_eq!(a.evaluations, b.evaluations);
    }

    #[test]
    fn test_candidate_failure_does_not_abort_the_run() {
        /// Fails for half the domain, peak at 40 inside the good half.
        struct Flaky;
        impl Fitness for Flaky {
            fn evaluate(&self, genes: &[f64]) -> Result<f64, EngineError> {
                if genes[0] > 50.0 {
                    return Err(EngineError::Simulation("synthetic failure".into()));
                }
                Ok(-(genes[0] - 40.0).powi(2))
            }
        }
        let optimizer = GeneticOptimizer::new(config(20, 15, 5));
        let outcome = optimizer.run(&one_gene_space(30.0), &Flaky, &CancelToken::new());
        assert_eq!(outcome.status, OptimizationStatus::Completed);
        assert!((outcome.best_genes[0] - 40.0).abs() < 10.0);
        assert!(outcome.best_fitness > WORST_FITNESS);
    }

    #[test]
    fn test_pre_cancelled_run_returns_baseline() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let optimizer = GeneticOptimizer::new(config(20, 10, 3));
        let outcome = optimizer.run(&one_gene_space(10.0), &Quadratic, &cancel);
        assert_eq!(outcome.status, OptimizationStatus::Cancelled);
        assert_eq!(outcome.generations_run, 0);
        // Best so far is still reported.
        assert_eq!(outcome.best_genes, vec![10.0]);
        assert_eq!(outcome.best_fitness, outcome.baseline_fitness);
    }

    #[test]
    fn test_zero_timeout_reports_timed_out() {
        let mut cfg = config(20, 10, 3);
        cfg.timeout = Some(Duration::ZERO);
        let outcome =
            GeneticOptimizer::new(cfg).run(&one_gene_space(10.0), &Quadratic, &CancelToken::new());
        assert_eq!(outcome.status, OptimizationStatus::TimedOut);
        assert_eq!(outcome.generations_run, 0);
    }

    #[test]
    fn test_plateau_stops_early() {
        /// Same score everywhere: no improvement is possible.
        struct Constant;
        impl Fitness for Constant {
            fn evaluate(&self, _genes: &[f64]) -> Result<f64, EngineError> {
                Ok(1.0)
            }
        }
        let mut cfg = config(10, 50, 11);
        cfg.plateau_generations = Some(4);
        let outcome =
            GeneticOptimizer::new(cfg).run(&one_gene_space(10.0), &Constant, &CancelToken::new());
        assert_eq!(outcome.status, OptimizationStatus::Completed);
        assert!(outcome.generations_run <= 5);
    }

    #[test]
    fn test_optimize_strategy_end_to_end() {
        use crate::bars::{Bar, Timeframe};
        use crate::strategy::{CompareOp, Condition, RiskConfig};
        use chrono::TimeZone;

        let closes: Vec<f64> = (0..200)
            .map(|i| 100.0 + (i as f64 * 0.25).sin() * 10.0)
            .collect();
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                timestamp: chrono::Utc.timestamp_opt(i as i64 * 3600, 0).unwrap(),
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 1.0,
            })
            .collect();
        let series = PriceSeries::new("TEST", Timeframe::H1, bars).unwrap();
        let rules = StrategyRules {
            symbol: "TEST".into(),
            timeframe: Timeframe::H1,
            indicators: vec![],
            entry_conditions: vec![Condition::PriceLevel {
                op: CompareOp::Lt,
                value: 93.0,
            }],
            exit_conditions: vec![Condition::PriceLevel {
                op: CompareOp::Gt,
                value: 107.0,
            }],
            risk: RiskConfig::default(),
        };

        let cfg = OptimizerConfig {
            objective: Objective::TotalReturn,
            population_size: 15,
            generations: 10,
            seed: Some(21),
            plateau_generations: None,
            ..OptimizerConfig::default()
        };
        let record =
            optimize_strategy(&rules, &series, 10_000.0, cfg.clone(), &CancelToken::new());
        assert_eq!(record.status, OptimizationStatus::Completed);
        assert!(record.best_score >= record.original_score);
        assert_eq!(record.history.len(), record.generations_run);
        assert_eq!(record.original_params.len(), record.optimized_params.len());

        // Deterministic per seed across full pipeline runs.
        let again = optimize_strategy(&rules, &series, 10_000.0, cfg, &CancelToken::new());
        assert_eq!(record.history, again.history);
        assert_eq!(record.optimized_params, again.optimized_params);
    }

    #[test]
    fn test_optimize_strategy_no_data() {
        use crate::bars::Timeframe;
        use crate::strategy::{CompareOp, Condition, RiskConfig};

        let series = PriceSeries::new("EMPTY", Timeframe::H1, vec![]).unwrap();
        let rules = StrategyRules {
            symbol: "EMPTY".into(),
            timeframe: Timeframe::H1,
            indicators: vec![],
            entry_conditions: vec![Condition::PriceLevel {
                op: CompareOp::Gt,
                value: 0.0,
            }],
            exit_conditions: vec![],
            risk: RiskConfig::default(),
        };
        let record = optimize_strategy(
            &rules,
            &series,
            10_000.0,
            OptimizerConfig::default(),
            &CancelToken::new(),
        );
        assert_eq!(record.status, OptimizationStatus::NoData);
        assert!(record.history.is_empty());
        assert_eq!(record.generations_run, 0);
    }

    #[test]
    fn test_profit_factor_objective_is_finite() {
        use crate::metrics::Metrics;
        let mut m = Metrics {
            total_trades: 3,
            winning_trades: 3,
            losing_trades: 0,
            win_rate: 1.0,
            total_return: 0.1,
            total_pnl: 10.0,
            final_equity: 110.0,
            max_drawdown: 0.0,
            sharpe_ratio: 1.0,
            profit_factor: None,
            avg_win: 3.3,
            avg_loss: 0.0,
            avg_bars_held: 2.0,
        };
        assert_eq!(Objective::ProfitFactor.score(&m), PROFIT_FACTOR_CAP);
        m.winning_trades = 0;
        m.total_trades = 0;
        assert_eq!(Objective::ProfitFactor.score(&m), 0.0);
        m.profit_factor = Some(2.5);
        assert_eq!(Objective::ProfitFactor.score(&m), 2.5);
    }

    #[test]
    fn test_weighted_objective_combines_terms() {
        let m = Metrics {
            total_trades: 10,
            winning_trades: 6,
            losing_trades: 4,
            win_rate: 0.6,
            total_return: 0.2,
            total_pnl: 20.0,
            final_equity: 120.0,
            max_drawdown: 0.1,
            sharpe_ratio: 1.5,
            profit_factor: Some(2.0),
            avg_win: 5.0,
            avg_loss: 2.5,
            avg_bars_held: 3.0,
        };
        let objective = Objective::Weighted(vec![
            (0.5, Objective::Sharpe),
            (0.5, Objective::TotalReturn),
        ]);
        assert!((objective.score(&m) - (0.5 * 1.5 + 0.5 * 0.2)).abs() < 1e-12);
    }
}
