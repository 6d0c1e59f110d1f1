//! Error types shared by the fabric, the strategies and the orchestrator.
//!
//! Library code returns these typed errors; the binary wraps them in
//! `anyhow::Error` with additional context, the same split the rest of the
//! crate uses between internals and the command-line boundary.

use crate::cli::StrategyKind;
use thiserror::Error;

/// Failures raised by the in-process transport fabric.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Another rank failed and raised the group-wide abort flag.
    #[error("process group aborted")]
    Aborted,

    #[error("rank {rank} is out of range for a group of size {size}")]
    InvalidRank { rank: usize, size: usize },

    /// Negative tags are used by the fabric's own collectives.
    #[error("tag {0} is reserved for internal collectives")]
    ReservedTag(i32),

    /// Two endpoints of one channel disagree on its shape.
    #[error("mismatched channel endpoints: {0}")]
    Mismatch(String),

    #[error("request used before it was started")]
    Inactive,

    #[error("stream contexts are not available on this fabric")]
    StreamUnavailable,

    /// One-sided access outside an epoch, without a lock, or out of bounds.
    #[error("window access violation: {0}")]
    Window(String),

    #[error("failed to spawn rank thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("rank {0} panicked")]
    RankPanicked(usize),
}

/// Failures raised while configuring or running a benchmark.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("process group size must be even and at least 2, got {0}")]
    InvalidGroupSize(usize),

    #[error("invalid benchmark configuration: {0}")]
    InvalidConfig(String),

    #[error("payload of {elements} elements cannot be split into {partitions} equal partitions")]
    IndivisiblePayload { elements: usize, partitions: usize },

    #[error("failed to initialize the {strategy} strategy: {source}")]
    StrategyInit {
        strategy: StrategyKind,
        #[source]
        source: FabricError,
    },

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error("result sink error: {0}")]
    Io(#[from] std::io::Error),
}

pub type FabricResult<T> = std::result::Result<T, FabricError>;
