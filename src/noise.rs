//! Synthetic compute delay for the last partition of each round.
//!
//! The noise level is expressed in microseconds per megabyte, so the delay
//! for a partition of `b` bytes is `1e-12 * level * b` seconds. The delay is
//! only applied when it is clearly above the cost of reading the clock,
//! otherwise the measurement of the delay itself would dominate.

use std::hint;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::debug;

static ORIGIN: OnceLock<Instant> = OnceLock::new();

/// Monotonic wall-clock seconds since the first call in this process.
pub fn now() -> f64 {
    ORIGIN.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Average cost of one clock read, estimated from 1000 reads.
pub fn measure_clock_overhead() -> f64 {
    let start = now();
    for _ in 0..1000 {
        hint::black_box(now());
    }
    let end = now();
    // 1000 reads in the loop plus the two bracketing reads.
    (end - start) / 1002.0
}

/// Busy-waits until `seconds` have elapsed since `start`.
fn spin_for(start: f64, seconds: f64) {
    while now() - start < seconds {
        hint::spin_loop();
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NoiseInjector {
    delay: f64,
    overhead: f64,
    enabled: bool,
}

impl NoiseInjector {
    /// Measures the clock overhead and sizes the delay for one partition.
    pub fn calibrate(noise_level: u32, partition_bytes: usize) -> Self {
        let injector = Self::with_overhead(noise_level, partition_bytes, measure_clock_overhead());
        debug!(
            "Noise: {:.3e}s per round (clock overhead {:.3e}s, enabled: {})",
            injector.delay, injector.overhead, injector.enabled
        );
        injector
    }

    pub fn with_overhead(noise_level: u32, partition_bytes: usize, overhead: f64) -> Self {
        let delay = 1e-12 * f64::from(noise_level) * partition_bytes as f64;
        Self {
            delay,
            overhead,
            enabled: delay > 3.0 * overhead,
        }
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Delays the caller if `partition` is the last of `partition_count`.
    ///
    /// Returns the measured compute time, `0.0` when nothing was injected.
    pub fn inject(&self, partition: usize, partition_count: usize) -> f64 {
        if !self.enabled || partition + 1 != partition_count {
            return 0.0;
        }
        let tic = now();
        spin_for(tic, self.delay);
        now() - tic
    }
}
