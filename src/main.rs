//! # Partitioned Bandwidth Benchmark - Main Entry Point
//!
//! Sweeps every selected strategy over the configured threads, partitions
//! and noise levels. Each configuration launches a fresh in-process group of
//! ranks that runs the benchmark collectively; rank 0's result is added to
//! the run summary.
//!
//! ## Error Handling
//!
//! A failing configuration stops the sweep unless `--continue-on-error` is
//! given, in which case the failure is logged and the sweep moves on.

use anyhow::{Context, Result};
use clap::Parser;
use partcomm_benchmark::{
    benchmark::{BenchmarkConfig, BenchmarkRunner},
    cli::{Args, StrategyKind},
    fabric::{self, FabricConfig},
    logging,
    results::ResultsManager,
    utils::format_duration,
};
use std::time::Instant;
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let args = Args::parse();
    // Held until exit so buffered file logs are flushed.
    let _log_guard = logging::init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting Partitioned Bandwidth Benchmark v{}", partcomm_benchmark::VERSION);
    info!("Configuration: {:?}", args);

    let strategies = StrategyKind::expand_all(args.strategies.clone());
    let sweep = args.sweep();
    if sweep.is_empty() {
        warn!("The configuration sweep is empty, nothing to run");
    }

    let fabric_config = args.fabric_config();
    let mut results_manager = ResultsManager::new(args.summary_file.as_deref());
    let started = Instant::now();
    let mut failures = 0;

    for strategy in &strategies {
        for config in &sweep {
            match run_configuration(args.ranks, &fabric_config, config, *strategy, &mut results_manager) {
                Ok(()) => {}
                Err(e) => {
                    error!("Benchmark failed for {}: {:#}", strategy, e);
                    if !args.continue_on_error {
                        return Err(e);
                    }
                    failures += 1;
                }
            }
        }
    }

    results_manager.finalize()?;

    if failures > 0 {
        warn!("{} configurations failed", failures);
    }
    info!(
        "Benchmark completed {} runs in {}",
        results_manager.runs().len(),
        format_duration(started.elapsed())
    );
    Ok(())
}

/// Runs one strategy configuration on a fresh process group.
fn run_configuration(
    ranks: usize,
    fabric_config: &FabricConfig,
    config: &BenchmarkConfig,
    strategy: StrategyKind,
    results_manager: &mut ResultsManager,
) -> Result<()> {
    let runner = BenchmarkRunner::new(config.clone(), strategy);
    let output_name = runner.output_name();
    let mut runs = fabric::launch(ranks, fabric_config.clone(), |comm| runner.run(&comm))
        .with_context(|| format!("failed to run {}", output_name))?;

    // Every rank holds the same records; rank 0 owns the result file.
    if !runs.is_empty() {
        results_manager.add_run(runs.swap_remove(0));
    }
    Ok(())
}
