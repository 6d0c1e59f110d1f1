//! # Benchmark Engine Module
//!
//! Orchestrates one strategy configuration on one rank. Every rank of the
//! process group runs the same [`BenchmarkRunner`] concurrently; the runner
//! sweeps payload sizes, runs batches of timed rounds with a team of worker
//! threads, reduces the timings across the rank's role group and lets rank 0
//! decide whether the batch is statistically stable.
//!
//! ## Size Lifecycle
//!
//! 1. **Allocation**: a fresh [`TransferRegion`] sized by the data layout
//! 2. **Initialization**: the strategy is initialized collectively
//! 3. **Calibration**: the noise injector measures the clock overhead
//! 4. **Batches**: `warmup + repeat` rounds, reduced and judged, until the
//!    rerun policy accepts
//! 5. **Release**: the strategy tears down its requests and windows
//!
//! ## Rounds
//!
//! Each round is bracketed by group-wide barriers. Inside, the worker team
//! meets at a team barrier, samples the clock, runs the role's prepare,
//! per-partition and finalize hooks, samples the clock again and meets at a
//! second team barrier. The round's sample is the maximum over the workers.

use crate::{
    cli::StrategyKind,
    error::{BenchError, FabricError, FabricResult},
    fabric::Communicator,
    layout::{DataLayout, LayoutSpec},
    metrics::{RoundDistribution, RoundTiming, SampleBatch},
    noise::{self, NoiseInjector},
    region::TransferRegion,
    results::{BenchmarkRecord, ResultSink, StrategyRun},
    stats::{AggregateStat, Decision, RerunPolicy, TransferEstimate},
    strategy::{buddy_of, InitContext, Role, StrategyFactory, TransferStrategy},
    sync::{AbortOnUnwind, SpinBarrier, Team},
    utils::{self, format_bytes, format_rate, format_seconds},
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Tag of the receiver root's statistics message to rank 0.
const STATS_TAG: i32 = 10;

/// Configuration of one strategy run
///
/// One entry of the threads x partitions-per-thread x noise sweep. The same
/// configuration is handed to every rank of the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Worker threads per rank
    pub threads: usize,
    /// Partitions owned by each worker
    pub partitions_per_thread: usize,
    /// Rounds discarded at the start of each batch
    pub warmup: usize,
    /// Measured rounds per batch
    pub repeat: usize,
    /// Largest payload in elements
    pub max_count: usize,
    /// Synthetic compute per partition, in microseconds per megabyte
    pub noise_level: u32,
    pub policy: RerunPolicy,
    pub results_dir: PathBuf,
    /// Pin every worker to its own core
    pub pin_threads: bool,
    pub layout: LayoutSpec,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            partitions_per_thread: 1,
            warmup: crate::defaults::WARMUP,
            repeat: crate::defaults::REPEAT,
            max_count: crate::defaults::MAX_COUNT,
            noise_level: 0,
            policy: RerunPolicy::default(),
            results_dir: PathBuf::from(crate::defaults::RESULTS_DIR),
            pin_threads: false,
            layout: LayoutSpec::Contiguous,
        }
    }
}

impl BenchmarkConfig {
    /// Total partitions per rank.
    pub fn partitions(&self) -> usize {
        self.threads * self.partitions_per_thread
    }

    /// Payload sizes of the sweep, in elements.
    pub fn sizes(&self) -> Vec<usize> {
        utils::sweep_sizes(self.partitions(), self.max_count)
    }

    /// Rejects configurations no rank could run.
    pub fn validate(&self) -> Result<(), BenchError> {
        let invalid = |reason: String| Err(BenchError::InvalidConfig(reason));
        if self.threads == 0 {
            return invalid("at least one thread per rank is required".into());
        }
        if self.partitions_per_thread == 0 {
            return invalid("at least one partition per thread is required".into());
        }
        if self.repeat == 0 {
            return invalid("at least one measured round is required".into());
        }
        if self.max_count < self.partitions() {
            return invalid(format!(
                "max count {} is smaller than the {} partitions",
                self.max_count,
                self.partitions()
            ));
        }
        if !(self.policy.threshold.is_finite() && self.policy.threshold > 0.0) {
            return invalid(format!(
                "rerun threshold must be positive, got {}",
                self.policy.threshold
            ));
        }
        if self.policy.max_rerun == 0 {
            return invalid("max rerun must allow at least one batch".into());
        }
        Ok(())
    }
}

/// Single source of truth for the per-configuration banner.
struct BenchmarkConfigDisplay<'a> {
    config: &'a BenchmarkConfig,
    strategy: StrategyKind,
    ranks: usize,
    output_file: &'a str,
}

impl std::fmt::Display for BenchmarkConfigDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes = self.config.sizes();
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting Benchmark for: {}", self.strategy)?;
        writeln!(f, "  Ranks:              {} ({} pairs)", self.ranks, self.ranks / 2)?;
        writeln!(f, "  Threads per Rank:   {}", self.config.threads)?;
        writeln!(
            f,
            "  Partitions:         {} ({} per thread)",
            self.config.partitions(),
            self.config.partitions_per_thread
        )?;
        if let (Some(first), Some(last)) = (sizes.first(), sizes.last()) {
            writeln!(
                f,
                "  Payload Sizes:      {} to {} ({} sizes)",
                format_bytes(first * std::mem::size_of::<f64>()),
                format_bytes(last * std::mem::size_of::<f64>()),
                sizes.len()
            )?;
        }
        writeln!(f, "  Noise Level:        {} us/MB", self.config.noise_level)?;
        writeln!(
            f,
            "  Rounds per Batch:   {} (+{} warmup)",
            self.config.repeat, self.config.warmup
        )?;
        writeln!(
            f,
            "  Rerun Policy:       ci/time > {} for at most {} batches",
            self.config.policy.threshold, self.config.policy.max_rerun
        )?;
        writeln!(f, "  Layout:             {}", self.config.layout)?;
        writeln!(f, "  Output File:        {}", self.output_file)?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// What a rank knows about its place in the group.
struct RankEnv<'a> {
    comm: &'a Communicator,
    /// Ranks sharing this rank's role.
    role_comm: Communicator,
    role: Role,
    buddy: usize,
}

impl<'a> RankEnv<'a> {
    /// Collective: splits `comm` by role.
    fn new(comm: &'a Communicator) -> Result<Self> {
        let role = Role::of(comm.rank(), comm.size());
        Ok(Self {
            comm,
            role_comm: comm
                .split(usize::from(!role.is_sender()))
                .context("failed to split the group by role")?,
            role,
            buddy: buddy_of(comm.rank(), comm.size()),
        })
    }

    fn is_root(&self) -> bool {
        self.comm.rank() == 0
    }
}

/// Everything the workers of one payload size share.
struct SizeContext<'a> {
    strategy: &'a dyn TransferStrategy,
    region: &'a TransferRegion,
    layout: &'a dyn DataLayout,
    noise: NoiseInjector,
}

/// Runs one strategy configuration on the calling rank
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    strategy: StrategyKind,
}

impl BenchmarkRunner {
    pub fn new(config: BenchmarkConfig, strategy: StrategyKind) -> Self {
        Self { config, strategy }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Name of the result file this run writes.
    pub fn output_name(&self) -> String {
        StrategyFactory::output_name(
            self.strategy,
            self.config.threads,
            self.config.partitions(),
            self.config.noise_level,
        )
    }

    /// Runs the whole size sweep. Collective over `comm`: every rank of the
    /// group must call `run` with the same configuration.
    ///
    /// ## Returns
    /// - `Ok(StrategyRun)` with one record per payload size, identical on
    ///   every rank
    /// - `Err` on invalid configuration, strategy initialization failure or
    ///   a transport failure anywhere in the group
    pub fn run(&self, comm: &Communicator) -> Result<StrategyRun> {
        utils::validate_group_size(comm.size())?;
        self.config.validate()?;
        if self.strategy == StrategyKind::All {
            return Err(BenchError::InvalidConfig("'all' must be expanded before running".into()).into());
        }

        let env = RankEnv::new(comm)?;

        let output_name = self.output_name();
        let mut sink = if env.is_root() {
            info!(
                "{}",
                BenchmarkConfigDisplay {
                    config: &self.config,
                    strategy: self.strategy,
                    ranks: comm.size(),
                    output_file: &output_name,
                }
            );
            Some(ResultSink::create(&self.config.results_dir, &output_name)?)
        } else {
            None
        };

        let mut layout = self.config.layout.build()?;
        let mut records = Vec::new();
        for count in self.config.sizes() {
            let record = self
                .run_size(&env, layout.as_mut(), count)
                .with_context(|| format!("{} failed at {} elements", self.strategy, count))?;
            if let Some(sink) = sink.as_mut() {
                sink.append(&record)?;
            }
            records.push(record);
        }
        if let Some(sink) = &sink {
            info!("Results written to {}", sink.path().display());
        }

        Ok(StrategyRun {
            strategy: self.strategy,
            threads: self.config.threads,
            partitions: self.config.partitions(),
            noise_level: self.config.noise_level,
            layout: layout.name().to_string(),
            output_file: self.config.results_dir.join(&output_name),
            records,
            timestamp: chrono::Utc::now(),
        })
    }

    fn run_size(&self, env: &RankEnv<'_>, layout: &mut dyn DataLayout, count: usize) -> Result<BenchmarkRecord> {
        let unit = layout.describe_transfer_unit();
        let partitions = self.config.partitions();
        let region = TransferRegion::allocate(
            partitions,
            count * unit.element_multiplier,
            unit.communicated_bytes,
        )?;
        layout.prepare(partitions, region.elements_per_partition());
        debug!(
            "{} layout: {} on the wire, {} of user memory per element",
            layout.name(),
            format_bytes(unit.communicated_bytes),
            format_bytes(unit.allocated_bytes)
        );

        let strategy = StrategyFactory::initialize(
            self.strategy,
            &InitContext {
                comm: env.comm,
                region: &region,
                role: env.role,
                buddy: env.buddy,
                threads: self.config.threads,
            },
        )?;
        if strategy.held_locks() > 0 {
            debug!("Holding {} passive locks", strategy.held_locks());
        }

        let size = SizeContext {
            strategy: strategy.as_ref(),
            region: &region,
            layout: &*layout,
            noise: NoiseInjector::calibrate(self.config.noise_level, region.partition_bytes()),
        };
        if size.noise.is_enabled() {
            debug!(
                "Injecting {} of compute on the last partition",
                format_seconds(size.noise.delay())
            );
        }

        let size_bytes = region.payload_bytes();
        let mut rerun = 0;
        let record = loop {
            let batch = self.run_batch(env, &size)?;
            let BatchOutcome {
                decision,
                estimate,
                distribution,
            } = self.exchange(env, &batch, size_bytes, rerun)?;
            match decision {
                Decision::Rerun => {
                    if env.is_root() {
                        debug!(
                            "Rerunning {}: ci/time = {:.4} over {} rounds (attempt {})",
                            format_bytes(size_bytes),
                            estimate.relative_half_width(),
                            batch.measured(),
                            rerun + 1
                        );
                    }
                    rerun += 1;
                }
                Decision::Accept { forced } => {
                    if env.is_root() {
                        log_accepted(&estimate, rerun, forced);
                    }
                    break BenchmarkRecord::from_estimate(&estimate, rerun, forced, distribution);
                }
            }
        };

        strategy.release().context("failed to release the strategy")?;
        Ok(record)
    }

    /// Runs `warmup + repeat` rounds with a fresh worker team.
    fn run_batch(&self, env: &RankEnv<'_>, size: &SizeContext<'_>) -> Result<SampleBatch> {
        let threads = self.config.threads;
        let team_barrier = SpinBarrier::new(threads);
        let abort = env.comm.abort_handle();
        let world_rank = env.comm.world_rank();

        let outcomes: Vec<Result<Vec<RoundTiming>>> = crossbeam::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(threads);
            let mut outcomes = Vec::with_capacity(threads);
            for id in 0..threads {
                let team_barrier = &team_barrier;
                let spawned = scope
                    .builder()
                    .name(format!("rank-{world_rank}-w{id}"))
                    .spawn(move |_| {
                        if self.config.pin_threads {
                            utils::pin_current_thread(world_rank * threads + id);
                        }
                        let guard = AbortOnUnwind(abort.clone());
                        let team = Team::new(id, team_barrier, abort);
                        let result = self.run_worker(&team, env, size);
                        if result.is_err() {
                            guard.0.abort();
                        }
                        result
                    });
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(err) => {
                        abort.abort();
                        outcomes.push(Err(anyhow::Error::from(err).context("failed to spawn worker thread")));
                    }
                }
            }
            for (id, handle) in handles.into_iter().enumerate() {
                let outcome = match handle.join() {
                    Ok(result) => result.map_err(anyhow::Error::from),
                    Err(_) => {
                        abort.abort();
                        Err(anyhow!("worker {id} of rank {world_rank} panicked"))
                    }
                };
                outcomes.push(outcome);
            }
            outcomes
        })
        .map_err(|_| anyhow!("worker team of rank {world_rank} panicked"))?;

        let mut per_worker = Vec::with_capacity(threads);
        let mut aborted = None;
        for outcome in outcomes {
            match outcome {
                Ok(timings) => per_worker.push(timings),
                Err(err) if is_aborted(&err) => {
                    aborted.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        if let Some(err) = aborted {
            return Err(err);
        }

        let mut batch = SampleBatch::new(self.config.warmup, self.config.repeat)?;
        let rounds = self.config.warmup + self.config.repeat;
        for round in 0..rounds {
            let timing = per_worker
                .iter()
                .filter_map(|timings| timings.get(round).copied())
                .fold(RoundTiming::default(), RoundTiming::max);
            batch.record(timing);
        }
        Ok(batch)
    }

    /// One worker's share of every round of a batch.
    fn run_worker(&self, team: &Team<'_>, env: &RankEnv<'_>, size: &SizeContext<'_>) -> FabricResult<Vec<RoundTiming>> {
        let rounds = self.config.warmup + self.config.repeat;
        let partitions = size.region.partition_count();
        let owned = team.static_range(partitions);
        let strategy = size.strategy;
        let mut timings = Vec::with_capacity(rounds);

        for round in 0..rounds {
            if team.is_master() {
                env.comm.barrier()?;
            }
            team.barrier()?;
            let tic = noise::now();
            let mut compute = 0.0;

            if env.role.is_sender() {
                strategy.sender_prepare_round(team)?;
                for partition in owned.clone() {
                    // SAFETY: partitions are only written by their static
                    // owner, and every strategy completes the previous
                    // round's transfer of this partition before returning
                    // from finalize.
                    let data = unsafe { size.region.partition_mut(partition) };
                    size.layout.transform_before_send(round, partition, data);
                    compute += size.noise.inject(partition, partitions);
                    strategy.sender_signal_ready(team, partition)?;
                }
                strategy.sender_finalize_round(team)?;
            } else {
                strategy.receiver_prepare_round(team)?;
                for partition in owned.clone() {
                    strategy.receiver_poll_ready(team, partition)?;
                }
                strategy.receiver_finalize_round(team)?;
                for partition in owned.clone() {
                    // SAFETY: finalize returned, so no transfer into this
                    // partition is in flight until the next prepare.
                    let data = unsafe { size.region.partition(partition) };
                    size.layout.transform_after_receive(round, partition, data);
                }
            }

            let toc = noise::now();
            team.barrier()?;
            if team.is_master() {
                env.comm.barrier()?;
            }
            timings.push(RoundTiming {
                elapsed: toc - tic,
                compute,
            });
        }
        Ok(timings)
    }

    /// Reduces the batch over the role groups, lets rank 0 decide, and
    /// returns the outcome every rank agrees on.
    fn exchange(&self, env: &RankEnv<'_>, batch: &SampleBatch, size_bytes: usize, rerun: usize) -> Result<BatchOutcome> {
        let elapsed = batch.elapsed_stat();
        let compute = batch.compute_stat();
        let group = env.role_comm.size();
        let receiver_root = env.comm.size() / 2;

        let reduced = env
            .role_comm
            .reduce_sum(&[elapsed.mean, elapsed.std_dev, compute.mean, compute.std_dev], 0)?;

        let mut wire = Vec::new();
        if let Some(sum) = reduced {
            let elapsed = AggregateStat {
                mean: sum[0],
                std_dev: sum[1],
            }
            .averaged_over(group);
            let compute = AggregateStat {
                mean: sum[2],
                std_dev: sum[3],
            }
            .averaged_over(group);

            if env.is_root() {
                let receiver = match env.comm.recv(receiver_root, STATS_TAG)?.as_slice() {
                    [mean, std_dev] => AggregateStat {
                        mean: *mean,
                        std_dev: *std_dev,
                    },
                    other => {
                        return Err(FabricError::Mismatch(format!(
                            "receiver statistics carry {} values, expected 2",
                            other.len()
                        ))
                        .into())
                    }
                };
                let estimate = TransferEstimate::compute(size_bytes, elapsed, compute, receiver, self.config.repeat);
                wire = encode_outcome(&BatchOutcome {
                    decision: self.config.policy.decide(estimate.ci_time, estimate.adjusted_time, rerun),
                    estimate,
                    distribution: batch.distribution(),
                });
            } else if env.comm.rank() == receiver_root {
                env.comm.send(0, STATS_TAG, &[elapsed.mean, elapsed.std_dev])?;
            }
        }

        let wire = env.comm.broadcast(wire, 0)?;
        Ok(decode_outcome(&wire, size_bytes, self.config.repeat)?)
    }
}

fn log_accepted(estimate: &TransferEstimate, rerun: usize, forced: bool) {
    let summary = format!(
        "{:>10}: {} ± {} -> {} ({} reruns)",
        format_bytes(estimate.size_bytes),
        format_seconds(estimate.adjusted_time),
        format_seconds(estimate.ci_time),
        format_rate(estimate.bandwidth_gbps * 1e9),
        rerun
    );
    if forced {
        warn!(
            "{} accepted without reaching the stability threshold (ci/time = {:.4})",
            summary,
            estimate.relative_half_width()
        );
    } else {
        info!("{}", summary);
    }
}

fn is_aborted(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<FabricError>(), Some(FabricError::Aborted))
}

/// What rank 0 decided about a batch.
#[derive(Debug, Clone, PartialEq)]
struct BatchOutcome {
    decision: Decision,
    estimate: TransferEstimate,
    /// Rank 0's measured rounds.
    distribution: RoundDistribution,
}

const OUTCOME_LEN: usize = 12;

/// `[decision, sender mean/std, compute mean/std, receiver mean/std,
/// samples, min, p50, p99, max]`
fn encode_outcome(outcome: &BatchOutcome) -> Vec<f64> {
    let code = match outcome.decision {
        Decision::Rerun => 0.0,
        Decision::Accept { forced: false } => 1.0,
        Decision::Accept { forced: true } => 2.0,
    };
    let estimate = &outcome.estimate;
    let distribution = &outcome.distribution;
    vec![
        code,
        estimate.sender.mean,
        estimate.sender.std_dev,
        estimate.compute.mean,
        estimate.compute.std_dev,
        estimate.receiver.mean,
        estimate.receiver.std_dev,
        distribution.samples as f64,
        distribution.min_ns as f64,
        distribution.p50_ns as f64,
        distribution.p99_ns as f64,
        distribution.max_ns as f64,
    ]
}

/// Rebuilds the outcome; every rank recomputes the estimate from the same
/// moments so records agree bit for bit.
fn decode_outcome(wire: &[f64], size_bytes: usize, repeat: usize) -> FabricResult<BatchOutcome> {
    let &[code, s_mean, s_std, c_mean, c_std, r_mean, r_std, samples, min, p50, p99, max] = wire else {
        return Err(FabricError::Mismatch(format!(
            "batch outcome carries {} values, expected {}",
            wire.len(),
            OUTCOME_LEN
        )));
    };
    let decision = match code as u8 {
        0 => Decision::Rerun,
        1 => Decision::Accept { forced: false },
        _ => Decision::Accept { forced: true },
    };
    let stat = |mean, std_dev| AggregateStat { mean, std_dev };
    Ok(BatchOutcome {
        decision,
        estimate: TransferEstimate::compute(
            size_bytes,
            stat(s_mean, s_std),
            stat(c_mean, c_std),
            stat(r_mean, r_std),
            repeat,
        ),
        distribution: RoundDistribution {
            samples: samples as u64,
            min_ns: min as u64,
            p50_ns: p50 as u64,
            p99_ns: p99 as u64,
            max_ns: max as u64,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{launch, FabricConfig};
    use crate::layout::{Contiguous, TransferUnit};
    use crate::sync::static_owner;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashMap};
    use tempfile::TempDir;

    /// Contiguous layout that records which threads touch each partition.
    #[derive(Default)]
    struct OwnerLog(Mutex<HashMap<usize, BTreeSet<String>>>);

    impl OwnerLog {
        fn touch(&self, partition: usize) {
            let name = std::thread::current().name().unwrap_or_default().to_string();
            self.0.lock().entry(partition).or_default().insert(name);
        }
    }

    impl DataLayout for OwnerLog {
        fn name(&self) -> &'static str {
            "owners"
        }

        fn describe_transfer_unit(&self) -> TransferUnit {
            Contiguous.describe_transfer_unit()
        }

        fn prepare(&mut self, _partitions: usize, _elements_per_partition: usize) {}

        fn transform_before_send(&self, _round: usize, partition: usize, _data: &mut [f64]) {
            self.touch(partition);
        }

        fn transform_after_receive(&self, _round: usize, partition: usize, _data: &[f64]) {
            self.touch(partition);
        }
    }

    fn small_config(dir: &TempDir) -> BenchmarkConfig {
        BenchmarkConfig {
            threads: 2,
            partitions_per_thread: 2,
            warmup: 1,
            repeat: 4,
            max_count: 16,
            results_dir: dir.path().to_path_buf(),
            policy: RerunPolicy {
                threshold: 0.05,
                max_rerun: 2,
            },
            ..BenchmarkConfig::default()
        }
    }

    #[test]
    fn test_benchmark_config_validation() {
        let config = BenchmarkConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.partitions(), 1);
        assert_eq!(config.sizes().len(), 23);

        let cases = [
            BenchmarkConfig { threads: 0, ..config.clone() },
            BenchmarkConfig { partitions_per_thread: 0, ..config.clone() },
            BenchmarkConfig { repeat: 0, ..config.clone() },
            BenchmarkConfig { threads: 4, partitions_per_thread: 4, max_count: 8, ..config.clone() },
            BenchmarkConfig { policy: RerunPolicy { threshold: 0.0, max_rerun: 5 }, ..config.clone() },
            BenchmarkConfig { policy: RerunPolicy { threshold: f64::NAN, max_rerun: 5 }, ..config.clone() },
        ];
        for case in cases {
            assert!(matches!(case.validate(), Err(BenchError::InvalidConfig(_))), "{case:?}");
        }
    }

    #[test]
    fn test_outcome_wire_format() {
        let stat = |mean: f64| AggregateStat { mean, std_dev: mean / 10.0 };
        let outcome = BatchOutcome {
            decision: Decision::Accept { forced: true },
            estimate: TransferEstimate::compute(64, stat(1.0), stat(0.25), stat(2.0), 8),
            distribution: RoundDistribution {
                samples: 8,
                min_ns: 100,
                p50_ns: 150,
                p99_ns: 900,
                max_ns: 1000,
            },
        };
        let wire = encode_outcome(&outcome);
        assert_eq!(wire.len(), OUTCOME_LEN);
        assert_eq!(decode_outcome(&wire, 64, 8).unwrap(), outcome);
        assert!(decode_outcome(&wire[..7], 64, 8).is_err());
    }

    #[test]
    fn test_output_name_uses_total_partitions() {
        let dir = TempDir::new().unwrap();
        let runner = BenchmarkRunner::new(small_config(&dir), StrategyKind::Multi);
        assert_eq!(runner.output_name(), "bw_multi_2threads_4parts_0noise.txt");
    }

    #[test]
    fn test_run_records_every_size_on_every_rank() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let runs = launch(2, FabricConfig::default(), |comm| {
            BenchmarkRunner::new(config.clone(), StrategyKind::Partitioned).run(&comm)
        })
        .unwrap();

        assert_eq!(runs[0].records.len(), 3, "sizes 4, 8 and 16");
        assert_eq!(runs[0].records, runs[1].records);
        assert_eq!(
            runs[0].records.iter().map(|r| r.size_bytes).collect::<Vec<_>>(),
            vec![32, 64, 128]
        );
        assert!(runs[0].records.iter().all(|r| r.reruns < 2));

        let csv = std::fs::read_to_string(dir.path().join("bw_part_2threads_4parts_0noise.txt")).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }

    #[test]
    fn test_odd_group_is_rejected_everywhere() {
        let dir = TempDir::new().unwrap();
        let config = small_config(&dir);
        let err = launch(3, FabricConfig::default(), |comm| {
            BenchmarkRunner::new(config.clone(), StrategyKind::Single).run(&comm)
        })
        .unwrap_err();
        assert!(err.to_string().contains("even"), "{err}");
    }

    #[test]
    fn test_partitions_keep_their_worker_across_batches() {
        let dir = TempDir::new().unwrap();
        let config = BenchmarkConfig {
            threads: 3,
            partitions_per_thread: 2,
            ..small_config(&dir)
        };
        let partitions = config.partitions();
        let threads = config.threads;

        for kind in [StrategyKind::Multi, StrategyKind::Stream] {
            let runner = BenchmarkRunner::new(config.clone(), kind);
            let owners = launch(2, FabricConfig::default(), |comm| {
                let env = RankEnv::new(&comm)?;
                let region = TransferRegion::allocate(partitions, partitions * 4, 8)?;
                let strategy = StrategyFactory::initialize(
                    kind,
                    &InitContext {
                        comm: &comm,
                        region: &region,
                        role: env.role,
                        buddy: env.buddy,
                        threads,
                    },
                )?;
                let log = OwnerLog::default();
                let size = SizeContext {
                    strategy: strategy.as_ref(),
                    region: &region,
                    layout: &log,
                    noise: NoiseInjector::calibrate(0, region.partition_bytes()),
                };
                for _ in 0..3 {
                    runner.run_batch(&env, &size)?;
                }
                strategy.release()?;
                Ok(log.0.into_inner())
            })
            .unwrap();

            for (rank, owners) in owners.iter().enumerate() {
                assert_eq!(owners.len(), partitions, "{kind}");
                for (&partition, names) in owners {
                    let owner = format!("rank-{rank}-w{}", static_owner(partition, partitions, threads));
                    assert_eq!(names, &BTreeSet::from([owner]), "{kind}: partition {partition}");
                }
            }
        }
    }
}
