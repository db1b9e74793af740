use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stratopt::{
    aggregate, optimize_strategy, Backtester, CancelToken, Objective, OptimizationStatus,
    OptimizerConfig, PriceSeries, StrategyRules,
};

#[derive(Parser, Debug)]
#[command(name = "stratopt")]
#[command(about = "Strategy backtesting & evolutionary parameter optimization")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Print verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a single backtest over historical bars
    Backtest {
        /// CSV file of bars (timestamp,open,high,low,close,volume)
        #[arg(short, long)]
        bars: PathBuf,

        /// JSON strategy rule set
        #[arg(short, long)]
        rules: PathBuf,

        /// Starting capital
        #[arg(short, long, default_value = "10000.0")]
        capital: f64,
    },

    /// Search for improved rule parameters with the evolutionary optimizer
    Optimize {
        /// CSV file of bars (timestamp,open,high,low,close,volume)
        #[arg(short, long)]
        bars: PathBuf,

        /// JSON strategy rule set
        #[arg(short, long)]
        rules: PathBuf,

        /// Starting capital
        #[arg(short, long, default_value = "10000.0")]
        capital: f64,

        /// Objective to maximize (sharpe, total_return, win_rate, profit_factor)
        #[arg(short, long, default_value = "sharpe")]
        objective: String,

        /// Population size per generation
        #[arg(short, long, default_value = "30")]
        population: usize,

        /// Generation budget
        #[arg(short, long, default_value = "25")]
        generations: usize,

        /// Fixed random seed for a reproducible search
        #[arg(short, long)]
        seed: Option<u64>,

        /// Wall-clock budget in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

/// One CSV row of the bar file. Timestamps are RFC 3339.
#[derive(Debug, Deserialize)]
struct BarRecord {
    timestamp: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Commands::Backtest { bars, rules, capital } => run_backtest(&bars, &rules, capital),
        Commands::Optimize {
            bars,
            rules,
            capital,
            objective,
            population,
            generations,
            seed,
            timeout_secs,
        } => run_optimize(
            &bars,
            &rules,
            capital,
            &objective,
            population,
            generations,
            seed,
            timeout_secs,
        ),
    }
}

fn load_rules(path: &PathBuf) -> Result<StrategyRules> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading rules file {}", path.display()))?;
    let rules = StrategyRules::from_json(&json)?;
    Ok(rules)
}

fn load_series(path: &PathBuf, rules: &StrategyRules) -> Result<PriceSeries> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening bar file {}", path.display()))?;
    let mut bars = Vec::new();
    for record in reader.deserialize() {
        let rec: BarRecord = record.context("parsing bar row")?;
        bars.push(stratopt::Bar {
            timestamp: rec.timestamp,
            open: rec.open,
            high: rec.high,
            low: rec.low,
            close: rec.close,
            volume: rec.volume,
        });
    }
    info!(bars = bars.len(), symbol = %rules.symbol, "loaded price series");
    let series = PriceSeries::new(rules.symbol.clone(), rules.timeframe, bars)?;
    Ok(series)
}

fn parse_objective(name: &str) -> Result<Objective> {
    match name {
        "sharpe" => Ok(Objective::Sharpe),
        "total_return" => Ok(Objective::TotalReturn),
        "win_rate" => Ok(Objective::WinRate),
        "profit_factor" => Ok(Objective::ProfitFactor),
        other => anyhow::bail!("unknown objective '{}'", other),
    }
}

fn run_backtest(bars: &PathBuf, rules_path: &PathBuf, capital: f64) -> Result<()> {
    let rules = load_rules(rules_path)?;
    let series = load_series(bars, &rules)?;

    let result = Backtester::new(capital).run(&rules, &series)?;
    let m = &result.metrics;

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST: {} {} ({} bars)", rules.symbol, rules.timeframe, series.len());
    println!("{}", "=".repeat(60));
    println!("  Trades:        {} ({} W / {} L)", m.total_trades, m.winning_trades, m.losing_trades);
    println!("  Win rate:      {:.1}%", m.win_rate * 100.0);
    println!("  Total return:  {:.2}%", m.total_return * 100.0);
    println!("  Net P&L:       {:.2}", m.total_pnl);
    println!("  Max drawdown:  {:.2}%", m.max_drawdown * 100.0);
    println!("  Sharpe:        {:.2}", m.sharpe_ratio);
    match m.profit_factor {
        Some(pf) => println!("  Profit factor: {:.2}", pf),
        None => println!("  Profit factor: n/a (no losing trades)"),
    }
    println!("  Final equity:  {:.2}", m.final_equity);

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_optimize(
    bars: &PathBuf,
    rules_path: &PathBuf,
    capital: f64,
    objective: &str,
    population: usize,
    generations: usize,
    seed: Option<u64>,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let rules = load_rules(rules_path)?;
    let series = load_series(bars, &rules)?;

    let config = OptimizerConfig {
        objective: parse_objective(objective)?,
        population_size: population,
        generations,
        seed,
        timeout: timeout_secs.map(Duration::from_secs),
        ..OptimizerConfig::default()
    };

    let record = optimize_strategy(&rules, &series, capital, config, &CancelToken::new());

    println!("\n{}", "=".repeat(60));
    println!("OPTIMIZATION: {} {} (objective: {})", rules.symbol, rules.timeframe, objective);
    println!("{}", "=".repeat(60));
    println!("  Status:       {}", record.status);
    println!("  Generations:  {}", record.generations_run);
    println!("  Evaluations:  {}", record.evaluations);
    println!("  Baseline:     {:.4}", record.original_score);
    println!("  Best:         {:.4}", record.best_score);
    match record.improvement_percent {
        Some(pct) => println!("  Improvement:  {:+.1}%", pct),
        None => println!("  Improvement:  n/a (zero baseline score)"),
    }

    println!("\n  {:>4} {:>14} {:>14}", "gen", "best", "mean");
    println!("  {}", "-".repeat(34));
    for stats in &record.history {
        println!(
            "  {:>4} {:>14.4} {:>14.4}",
            stats.generation, stats.best_fitness, stats.mean_fitness
        );
    }

    println!("\n  {:<28} {:>12} {:>12}", "parameter", "original", "optimized");
    println!("  {}", "-".repeat(54));
    for (orig, opt) in record.original_params.iter().zip(&record.optimized_params) {
        println!("  {:<28} {:>12.4} {:>12.4}", orig.name, orig.value, opt.value);
    }

    if matches!(
        record.status,
        OptimizationStatus::Completed | OptimizationStatus::TimedOut | OptimizationStatus::Cancelled
    ) {
        let optimized_values: Vec<f64> = record.optimized_params.iter().map(|p| p.value).collect();
        let optimized_rules = rules.with_parameters(&optimized_values)?;
        let engine = Backtester::new(capital);
        let baseline_run = engine.run(&rules, &series)?;
        let optimized_run = engine.run(&optimized_rules, &series)?;
        let report = aggregate(baseline_run, optimized_run);

        println!("\n  {:<16} {:>12} {:>12}", "metric", "baseline", "optimized");
        println!("  {}", "-".repeat(42));
        let b = &report.baseline.metrics;
        let o = &report.optimized.metrics;
        println!("  {:<16} {:>11.2}% {:>11.2}%", "total return", b.total_return * 100.0, o.total_return * 100.0);
        println!("  {:<16} {:>12.2} {:>12.2}", "sharpe", b.sharpe_ratio, o.sharpe_ratio);
        println!("  {:<16} {:>11.1}% {:>11.1}%", "win rate", b.win_rate * 100.0, o.win_rate * 100.0);
        println!("  {:<16} {:>11.2}% {:>11.2}%", "max drawdown", b.max_drawdown * 100.0, o.max_drawdown * 100.0);
        println!("  {:<16} {:>12} {:>12}", "trades", b.total_trades, o.total_trades);
    }

    Ok(())
}
