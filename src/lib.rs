//! # Partitioned Bandwidth Benchmark Library
//!
//! A statistically rigorous bandwidth benchmark for point-to-point,
//! partitioned and one-sided transfers between pairs of ranks. For every
//! payload size of a power-of-two sweep it measures end-to-end transfer time,
//! computes confidence-interval-bounded bandwidth estimates and reruns a
//! measurement until the estimate is stable.
//!
//! ## Supported Strategies
//!
//! - **Single request**: one persistent request for the whole buffer
//! - **Multi request**: one persistent request per partition
//! - **Stream offload**: per-partition requests on per-thread stream contexts
//! - **Partitioned**: one partitioned request with per-partition readiness
//! - **One-sided**: passive locks, active epochs and fences, with one window
//!   per thread or one shared window
//!
//! ## Architecture Overview
//!
//! - `fabric`: in-process transport; ranks are named threads of one process
//! - `strategy`: the transfer protocols the orchestrator drives
//! - `benchmark`: size sweep, rerun loop and timed rounds
//! - `stats`: t-quantiles, confidence intervals and the rerun decision
//! - `results`: CSV result files and the JSON run summary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use partcomm_benchmark::{fabric, BenchmarkConfig, BenchmarkRunner, StrategyKind};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         threads: 2,
//!         partitions_per_thread: 4,
//!         max_count: 1 << 16,
//!         ..BenchmarkConfig::default()
//!     };
//!     let runs = fabric::launch(2, fabric::FabricConfig::default(), |comm| {
//!         BenchmarkRunner::new(config.clone(), StrategyKind::Partitioned).run(&comm)
//!     })?;
//!     for record in &runs[0].records {
//!         println!("{} bytes: {:.3} GB/s", record.size_bytes, record.bandwidth_gbps);
//!     }
//!     Ok(())
//! }
//! ```

/// Size sweep, rerun loop and thread-parallel timed rounds
pub mod benchmark;

/// Command-line interface and configuration sweep
pub mod cli;

pub mod error;

/// In-process transport fabric
///
/// Communicators, eager messages and collectives, persistent and partitioned
/// channels, one-sided windows and stream contexts between ranks that run as
/// threads of the current process.
pub mod fabric;

pub mod layout;

pub mod logging;

/// Per-batch sample collection with HDR histograms
pub mod metrics;

pub mod noise;

pub mod region;

/// CSV result files and the JSON run summary
pub mod results;

/// Confidence intervals and the rerun decision
pub mod stats;

pub mod strategy;

pub mod sync;

pub mod utils;

pub use benchmark::{BenchmarkConfig, BenchmarkRunner};
pub use cli::{Args, StrategyKind};
pub use error::{BenchError, FabricError};
pub use results::{BenchmarkRecord, ResultsManager, StrategyRun};
pub use strategy::{StrategyFactory, TransferStrategy};

/// The current version of the benchmark
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Ranks launched when none are requested; one sender/receiver pair
    pub const RANKS: usize = 2;

    /// Partitions per worker thread swept by default
    pub const PARTITIONS_PER_THREAD: [usize; 6] = [1, 2, 4, 8, 16, 32];

    /// Noise levels in microseconds per megabyte swept by default
    pub const NOISE_LEVELS: [u32; 3] = [0, 10, 100];

    /// Rounds discarded at the start of each batch
    pub const WARMUP: usize = 1;

    /// Measured rounds per batch
    pub const REPEAT: usize = 150;

    /// Largest payload in elements (32 MiB of doubles)
    pub const MAX_COUNT: usize = 1 << 22;

    /// Relative confidence half-width above which a batch is rerun
    pub const RERUN_THRESHOLD: f64 = 0.05;

    /// Batches per payload size before the estimate is accepted anyway
    pub const MAX_RERUN: usize = 50;

    pub const RESULTS_DIR: &str = "results";

    /// Stream contexts one rank may hold at the same time
    pub const MAX_STREAMS_PER_RANK: usize = 64;
}
