//! Per-batch timing sample collection.
//!
//! A batch is `warmup + repeat` rounds of one payload size. The first
//! `warmup` rounds are discarded; the remaining round samples feed the
//! statistical engine and an HDR histogram used for distribution logging.

use crate::stats::AggregateStat;
use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Timing of one round on one rank: the maximum over its workers.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RoundTiming {
    /// Seconds between the post-barrier and pre-barrier clock samples.
    pub elapsed: f64,
    /// Seconds spent in injected compute.
    pub compute: f64,
}

impl RoundTiming {
    pub fn max(self, other: RoundTiming) -> RoundTiming {
        RoundTiming {
            elapsed: self.elapsed.max(other.elapsed),
            compute: self.compute.max(other.compute),
        }
    }
}

/// Distribution summary of the measured rounds of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundDistribution {
    pub samples: u64,
    pub min_ns: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
}

pub struct SampleBatch {
    warmup: usize,
    seen: usize,
    elapsed: Vec<f64>,
    compute: Vec<f64>,
    histogram: Histogram<u64>,
}

impl SampleBatch {
    pub fn new(warmup: usize, repeat: usize) -> Result<Self> {
        Ok(Self {
            warmup,
            seen: 0,
            elapsed: Vec::with_capacity(repeat),
            compute: Vec::with_capacity(repeat),
            // 3 significant figures, auto-resizing.
            histogram: Histogram::<u64>::new(3)?,
        })
    }

    /// Records the next round; warmup rounds are dropped.
    pub fn record(&mut self, timing: RoundTiming) {
        self.seen += 1;
        if self.seen <= self.warmup {
            return;
        }
        self.elapsed.push(timing.elapsed);
        self.compute.push(timing.compute);
        self.histogram
            .saturating_record((timing.elapsed.max(0.0) * 1e9) as u64);
    }

    pub fn measured(&self) -> usize {
        self.elapsed.len()
    }

    pub fn elapsed_stat(&self) -> AggregateStat {
        AggregateStat::from_samples(&self.elapsed)
    }

    pub fn compute_stat(&self) -> AggregateStat {
        AggregateStat::from_samples(&self.compute)
    }

    pub fn distribution(&self) -> RoundDistribution {
        if self.histogram.is_empty() {
            return RoundDistribution::default();
        }
        RoundDistribution {
            samples: self.histogram.len(),
            min_ns: self.histogram.min(),
            p50_ns: self.histogram.value_at_quantile(0.5),
            p99_ns: self.histogram.value_at_quantile(0.99),
            max_ns: self.histogram.max(),
        }
    }
}
