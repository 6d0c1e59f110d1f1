use crate::benchmark::BenchmarkConfig;
use crate::fabric::FabricConfig;
use crate::layout::LayoutSpec;
use crate::stats::RerunPolicy;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Partitioned Bandwidth Benchmark - confidence-bounded bandwidth of
/// point-to-point, partitioned and one-sided transfers
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Strategies to benchmark (space-separated, or all)
    #[clap(short = 'm', value_enum, default_values_t = vec![StrategyKind::All], help_heading = "Core Options", num_args = 1..)]
    pub strategies: Vec<StrategyKind>,

    /// Number of ranks in the process group (even, at least 2)
    #[clap(short = 'n', long, default_value_t = crate::defaults::RANKS, help_heading = "Core Options")]
    pub ranks: usize,

    /// Keep going with the remaining configurations when one fails
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub continue_on_error: bool,

    /// Worker threads per rank; defaults to the available cores divided
    /// among the ranks
    #[clap(short = 't', long, num_args = 1.., value_delimiter = ',', help_heading = "Sweep")]
    pub threads: Vec<usize>,

    /// Partitions owned by each worker thread
    #[clap(short = 'p', long, num_args = 1.., value_delimiter = ',', default_values_t = crate::defaults::PARTITIONS_PER_THREAD.to_vec(), help_heading = "Sweep")]
    pub partitions_per_thread: Vec<usize>,

    /// Noise levels in microseconds per megabyte of partition payload
    #[clap(long, num_args = 1.., value_delimiter = ',', default_values_t = crate::defaults::NOISE_LEVELS.to_vec(), help_heading = "Sweep")]
    pub noise: Vec<u32>,

    /// Largest payload in elements; sizes double from the partition count
    #[clap(long, default_value_t = crate::defaults::MAX_COUNT, help_heading = "Sweep")]
    pub max_count: usize,

    /// Rounds discarded at the start of every batch
    #[clap(short = 'w', long, default_value_t = crate::defaults::WARMUP, help_heading = "Statistics")]
    pub warmup: usize,

    /// Measured rounds per batch
    #[clap(short = 'r', long, default_value_t = crate::defaults::REPEAT, help_heading = "Statistics")]
    pub repeat: usize,

    /// Maximum number of batches per payload size
    #[clap(long, default_value_t = crate::defaults::MAX_RERUN, help_heading = "Statistics")]
    pub max_rerun: usize,

    /// Relative confidence half-width above which a batch is rerun
    #[clap(long, default_value_t = crate::defaults::RERUN_THRESHOLD, help_heading = "Statistics")]
    pub rerun_threshold: f64,

    /// Directory receiving one result file per strategy configuration
    #[clap(short = 'o', long, default_value = crate::defaults::RESULTS_DIR, help_heading = "Output")]
    pub results_dir: PathBuf,

    /// JSON summary of every accepted record
    #[clap(long, help_heading = "Output")]
    pub summary_file: Option<PathBuf>,

    /// Data layout applied to each partition inside the timed interval
    #[clap(long, value_enum, default_value_t = LayoutKind::Contiguous, help_heading = "Layout")]
    pub layout: LayoutKind,

    /// Elements per contiguous block of the pack layout
    #[clap(long, default_value_t = 1, help_heading = "Layout")]
    pub pack_block: usize,

    /// Distance in elements between block starts of the pack layout
    #[clap(long, default_value_t = 2, help_heading = "Layout")]
    pub pack_stride: usize,

    /// Pin every worker thread to its own core
    #[clap(long, default_value_t = false, help_heading = "Fabric")]
    pub pin_threads: bool,

    /// Disable stream contexts in the fabric
    #[clap(long, default_value_t = false, help_heading = "Fabric")]
    pub no_streams: bool,

    /// Stream contexts each rank may hold at once
    #[clap(long, default_value_t = crate::defaults::MAX_STREAMS_PER_RANK, help_heading = "Fabric")]
    pub max_streams: usize,

    /// Let waits yield the CPU after a spin budget (implied when ranks x threads exceeds the core count)
    #[clap(long, default_value_t = false, help_heading = "Fabric")]
    pub oversubscribe: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write plain-text logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

/// Available communication strategies
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum StrategyKind {
    /// One persistent request for the whole buffer
    #[clap(name = "single")]
    Single,

    /// One persistent request per partition
    #[clap(name = "multi")]
    Multi,

    /// Per-partition requests on per-thread stream contexts
    #[clap(name = "stream")]
    Stream,

    /// Partitioned request
    #[clap(name = "part")]
    Partitioned,

    /// Passive-target puts, one window per thread
    #[clap(name = "rma")]
    Rma,

    /// Passive-target puts, one shared window
    #[clap(name = "rma-single")]
    RmaSingle,

    /// Active-target epochs, one window per thread
    #[clap(name = "rma-active")]
    RmaActive,

    /// Active-target epochs, one shared window
    #[clap(name = "rma-single-active")]
    RmaSingleActive,

    /// Fence epochs, one window per thread
    #[clap(name = "rma-fence")]
    RmaFence,

    /// All available strategies
    #[clap(name = "all")]
    All,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Single => write!(f, "Single Request"),
            StrategyKind::Multi => write!(f, "Multi Request"),
            StrategyKind::Stream => write!(f, "Stream Offload"),
            StrategyKind::Partitioned => write!(f, "Partitioned"),
            StrategyKind::Rma => write!(f, "RMA Passive"),
            StrategyKind::RmaSingle => write!(f, "RMA Passive Single Window"),
            StrategyKind::RmaActive => write!(f, "RMA Active"),
            StrategyKind::RmaSingleActive => write!(f, "RMA Active Single Window"),
            StrategyKind::RmaFence => write!(f, "RMA Fence"),
            StrategyKind::All => write!(f, "All Strategies"),
        }
    }
}

impl StrategyKind {
    /// Expand the "All" variant to every strategy, partitioned last
    pub fn expand_all(strategies: Vec<StrategyKind>) -> Vec<StrategyKind> {
        if strategies.contains(&StrategyKind::All) {
            vec![
                StrategyKind::Single,
                StrategyKind::Multi,
                StrategyKind::Stream,
                StrategyKind::Rma,
                StrategyKind::RmaActive,
                StrategyKind::RmaSingle,
                StrategyKind::RmaSingleActive,
                StrategyKind::RmaFence,
                StrategyKind::Partitioned,
            ]
        } else {
            strategies
        }
    }

    /// File name prefix of the strategy's result files
    pub fn output_prefix(&self) -> &'static str {
        match self {
            StrategyKind::Single => "bw_single",
            StrategyKind::Multi => "bw_multi",
            StrategyKind::Stream => "bw_stream",
            StrategyKind::Partitioned => "bw_part",
            StrategyKind::Rma => "bw_rma",
            StrategyKind::RmaSingle => "bw_rma_single",
            StrategyKind::RmaActive => "bw_rma_active",
            StrategyKind::RmaSingleActive => "bw_rma_single_active",
            StrategyKind::RmaFence => "bw_rma_fence",
            StrategyKind::All => "bw_all",
        }
    }
}

/// Data layouts selectable from the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum LayoutKind {
    /// Send the buffer as is
    #[clap(name = "contiguous")]
    Contiguous,

    /// Gather each partition from a strided buffer before sending
    #[clap(name = "pack")]
    Pack,
}

impl Args {
    /// Threads per rank to sweep, falling back to the cores left per rank
    pub fn thread_counts(&self) -> Vec<usize> {
        if self.threads.is_empty() {
            vec![(num_cpus::get() / self.ranks.max(1)).max(1)]
        } else {
            self.threads.clone()
        }
    }

    pub fn layout_spec(&self) -> LayoutSpec {
        match self.layout {
            LayoutKind::Contiguous => LayoutSpec::Contiguous,
            LayoutKind::Pack => LayoutSpec::StridedPack {
                block: self.pack_block,
                stride: self.pack_stride,
            },
        }
    }

    pub fn fabric_config(&self) -> FabricConfig {
        let threads = self.thread_counts().into_iter().max().unwrap_or(1);
        FabricConfig {
            streams: !self.no_streams,
            max_streams_per_rank: self.max_streams,
            oversubscribe: self.oversubscribe,
        }
        .for_team(self.ranks, threads)
    }

    /// Every benchmark configuration of the sweep: threads x partitions per
    /// thread x noise level, in that nesting order.
    pub fn sweep(&self) -> Vec<BenchmarkConfig> {
        let policy = RerunPolicy {
            threshold: self.rerun_threshold,
            max_rerun: self.max_rerun,
        };
        let mut configs = Vec::new();
        for threads in self.thread_counts() {
            for &partitions_per_thread in &self.partitions_per_thread {
                for &noise_level in &self.noise {
                    configs.push(BenchmarkConfig {
                        threads,
                        partitions_per_thread,
                        warmup: self.warmup,
                        repeat: self.repeat,
                        max_count: self.max_count,
                        noise_level,
                        policy,
                        results_dir: self.results_dir.clone(),
                        pin_threads: self.pin_threads,
                        layout: self.layout_spec(),
                    });
                }
            }
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_kind_display() {
        assert_eq!(StrategyKind::Single.to_string(), "Single Request");
        assert_eq!(StrategyKind::RmaSingleActive.to_string(), "RMA Active Single Window");
        assert_eq!(StrategyKind::All.to_string(), "All Strategies");
    }

    #[test]
    fn test_strategy_kind_expand_all() {
        let all = StrategyKind::expand_all(vec![StrategyKind::All]);
        assert_eq!(all.len(), 9);
        assert_eq!(all.first(), Some(&StrategyKind::Single));
        assert_eq!(all.last(), Some(&StrategyKind::Partitioned));
        assert!(!all.contains(&StrategyKind::All));
        assert_eq!(
            StrategyKind::expand_all(vec![StrategyKind::RmaFence]),
            vec![StrategyKind::RmaFence]
        );
        assert_eq!(StrategyKind::expand_all(vec![StrategyKind::Multi, StrategyKind::All]), all);
    }

    #[test]
    fn test_output_prefixes_are_unique() {
        let all = StrategyKind::expand_all(vec![StrategyKind::All]);
        let mut prefixes: Vec<_> = all.iter().map(StrategyKind::output_prefix).collect();
        prefixes.sort_unstable();
        prefixes.dedup();
        assert_eq!(prefixes.len(), all.len());
    }

    #[test]
    fn test_defaults_parse() {
        let args = Args::parse_from(["partcomm-benchmark"]);
        assert_eq!(args.strategies, vec![StrategyKind::All]);
        assert_eq!(args.ranks, 2);
        assert_eq!(args.partitions_per_thread, vec![1, 2, 4, 8, 16, 32]);
        assert_eq!(args.noise, vec![0, 10, 100]);
        assert_eq!(args.repeat, 150);
        assert_eq!(args.max_count, 1 << 22);
        assert!(!args.thread_counts().is_empty());
    }

    #[test]
    fn test_sweep_is_cartesian_product() {
        let args = Args::parse_from([
            "partcomm-benchmark",
            "-m",
            "single",
            "part",
            "--threads",
            "1,2",
            "-p",
            "4",
            "--noise",
            "0,10,100",
            "--layout",
            "pack",
        ]);
        assert_eq!(args.strategies, vec![StrategyKind::Single, StrategyKind::Partitioned]);
        let sweep = args.sweep();
        assert_eq!(sweep.len(), 6);
        assert_eq!(sweep[0].threads, 1);
        assert_eq!(sweep[3].threads, 2);
        assert_eq!(sweep[4].noise_level, 10);
        assert_eq!(sweep[4].partitions(), 8);
        assert_eq!(sweep[0].layout, LayoutSpec::StridedPack { block: 1, stride: 2 });
    }

    #[test]
    fn test_fabric_config_follows_flags() {
        let args = Args::parse_from(["partcomm-benchmark", "--no-streams", "--max-streams", "3"]);
        let config = args.fabric_config();
        assert!(!config.streams);
        assert_eq!(config.max_streams_per_rank, 3);
        // The default thread count fills the cores, so only a host with
        // fewer cores than ranks is oversubscribed.
        assert_eq!(config.oversubscribe, args.ranks > num_cpus::get());

        let forced = Args::parse_from(["partcomm-benchmark", "--oversubscribe"]);
        assert!(forced.fabric_config().oversubscribe);
    }

    #[test]
    fn test_fabric_config_detects_oversubscription() {
        let threads = (num_cpus::get() + 1).to_string();
        let args = Args::parse_from(["partcomm-benchmark", "--ranks", "2", "--threads", "1", &threads]);
        assert!(args.fabric_config().oversubscribe);
    }
}
