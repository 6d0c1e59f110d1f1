//! # Statistical Engine
//!
//! Converts per-round timing samples into confidence-bounded estimates and
//! decides whether a measurement batch is stable enough to keep.
//!
//! ## Model
//!
//! - Each role group contributes a mean and a Bessel-corrected standard
//!   deviation over the `repeat` measured rounds.
//! - The transfer time is the receiver mean minus the sender's injected
//!   compute mean. Its half-width uses a pooled two-sample standard error
//!   with `2·repeat − 2` degrees of freedom.
//! - A batch is rerun while the half-width exceeds `threshold` times the
//!   transfer time, up to a fixed number of attempts.
//!
//! Student-t quantiles come from a small immutable table with linear
//! interpolation between tabulated degrees of freedom.

use serde::{Deserialize, Serialize};

/// Two-sided 90% Student-t quantiles keyed by degrees of freedom.
///
/// The last entry stands in for every larger value (normal limit).
pub const T_TABLE: [(usize, f64); 14] = [
    (0, 0.0),
    (1, 6.314),
    (2, 2.920),
    (3, 2.353),
    (4, 2.132),
    (5, 2.015),
    (7, 1.895),
    (10, 1.812),
    (15, 1.753),
    (20, 1.725),
    (30, 1.697),
    (50, 1.676),
    (100, 1.660),
    (1000, 1.645),
];

/// Student-t quantile for `dof` degrees of freedom.
///
/// ## Behavior
/// - `dof == 0` returns `0.0`
/// - tabulated values are returned verbatim
/// - values between two keys are linearly interpolated
/// - `dof >= 1000` returns the normal limit `1.645`
///
/// ## Examples
///
/// ```rust
/// # use partcomm_benchmark::stats::t_quantile;
/// assert_eq!(t_quantile(3), 2.353);
/// assert!((t_quantile(6) - 1.955).abs() < 1e-12);
/// assert_eq!(t_quantile(4000), 1.645);
/// ```
pub fn t_quantile(dof: usize) -> f64 {
    let upper = match T_TABLE.iter().position(|&(key, _)| key >= dof) {
        Some(index) => index,
        None => return T_TABLE[T_TABLE.len() - 1].1,
    };
    let (nu_up, t_up) = T_TABLE[upper];
    if nu_up == dof || upper == 0 {
        return t_up;
    }
    let (nu_low, t_low) = T_TABLE[upper - 1];
    t_low + (t_up - t_low) / (nu_up - nu_low) as f64 * (dof - nu_low) as f64
}

/// Sample mean and Bessel-corrected standard deviation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStat {
    pub mean: f64,
    pub std_dev: f64,
}

impl AggregateStat {
    /// Aggregates `samples`; with fewer than two samples the deviation is
    /// reported as `0.0`.
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        // Deviations are taken from the first sample so a constant batch
        // has exactly zero spread.
        let origin = samples[0];
        let n = samples.len() as f64;
        let (sum, squares) = samples.iter().fold((0.0, 0.0), |(sum, squares), &v| {
            let d = v - origin;
            (sum + d, squares + d * d)
        });
        let mean = origin + sum / n;
        let std_dev = if samples.len() < 2 {
            0.0
        } else {
            ((squares - sum * sum / n) / (n - 1.0)).max(0.0).sqrt()
        };
        Self { mean, std_dev }
    }

    /// Divides both moments by `n`, turning a group sum into a group mean.
    pub fn averaged_over(self, n: usize) -> Self {
        let n = n.max(1) as f64;
        Self {
            mean: self.mean / n,
            std_dev: self.std_dev / n,
        }
    }
}

/// Half-width of a confidence interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval(f64);

impl ConfidenceInterval {
    /// Interval on a mean of `repeat` samples: `std · t(repeat) · √(1/repeat)`.
    pub fn of_mean(std_dev: f64, repeat: usize) -> Self {
        let repeat = repeat.max(1);
        Self(std_dev * t_quantile(repeat) * (1.0 / repeat as f64).sqrt())
    }

    /// Interval on the difference of two means with pooled deviation.
    pub fn of_difference(std_a: f64, std_b: f64, repeat: usize) -> Self {
        let repeat = repeat.max(1);
        let pooled = (0.5 * (std_a.powi(2) + std_b.powi(2))).sqrt();
        let dof = (2 * repeat).saturating_sub(2);
        Self(t_quantile(dof) * pooled * (2.0 / repeat as f64).sqrt())
    }

    pub fn half_width(self) -> f64 {
        self.0
    }
}

/// Bandwidth estimate for one payload size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransferEstimate {
    pub size_bytes: usize,
    pub sender: AggregateStat,
    pub receiver: AggregateStat,
    pub compute: AggregateStat,
    /// Receiver time minus injected compute time.
    pub adjusted_time: f64,
    pub ci_sender: f64,
    pub ci_receiver: f64,
    pub ci_compute: f64,
    pub ci_time: f64,
    pub bandwidth_gbps: f64,
}

impl TransferEstimate {
    pub fn compute(
        size_bytes: usize,
        sender: AggregateStat,
        compute: AggregateStat,
        receiver: AggregateStat,
        repeat: usize,
    ) -> Self {
        let adjusted_time = receiver.mean - compute.mean;
        Self {
            size_bytes,
            sender,
            receiver,
            compute,
            adjusted_time,
            ci_sender: ConfidenceInterval::of_mean(sender.std_dev, repeat).half_width(),
            ci_receiver: ConfidenceInterval::of_mean(receiver.std_dev, repeat).half_width(),
            ci_compute: ConfidenceInterval::of_mean(compute.std_dev, repeat).half_width(),
            ci_time: ConfidenceInterval::of_difference(receiver.std_dev, compute.std_dev, repeat)
                .half_width(),
            bandwidth_gbps: (size_bytes as f64 / 1e9) / adjusted_time,
        }
    }

    /// Half-width relative to the transfer time.
    pub fn relative_half_width(&self) -> f64 {
        self.ci_time / self.adjusted_time
    }
}

/// Outcome of one measurement batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Rerun,
    /// `forced` is set when the batch is kept only because attempts ran out.
    Accept { forced: bool },
}

/// Stability criterion for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerunPolicy {
    pub threshold: f64,
    pub max_rerun: usize,
}

impl Default for RerunPolicy {
    fn default() -> Self {
        Self {
            threshold: crate::defaults::RERUN_THRESHOLD,
            max_rerun: crate::defaults::MAX_RERUN,
        }
    }
}

impl RerunPolicy {
    /// Decides after attempt number `rerun` (0-based).
    ///
    /// Reruns while `ci_time / time` is strictly above the threshold and
    /// `rerun < max_rerun - 1`, so at most `max_rerun` batches run. A ratio
    /// that is not a number (zero time) counts as stable.
    pub fn decide(&self, ci_time: f64, time: f64, rerun: usize) -> Decision {
        let unstable = ci_time / time > self.threshold;
        if unstable && rerun + 1 < self.max_rerun {
            Decision::Rerun
        } else {
            Decision::Accept { forced: unstable }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn test_t_quantile_tabulated_values() {
        for &(dof, t) in &T_TABLE {
            assert_eq!(t_quantile(dof), t, "dof {dof}");
        }
        assert_eq!(t_quantile(0), 0.0);
        assert_eq!(t_quantile(1), 6.314);
        assert_eq!(t_quantile(5), 2.015);
    }

    #[test]
    fn test_t_quantile_interpolates() {
        assert!((t_quantile(6) - 1.955).abs() < EPS);
        assert!((t_quantile(8) - (1.895 + (1.812 - 1.895) / 3.0)).abs() < EPS);
        assert!((t_quantile(149) - (1.660 + (1.645 - 1.660) / 900.0 * 49.0)).abs() < EPS);
        assert!((t_quantile(298) - (1.660 + (1.645 - 1.660) / 900.0 * 198.0)).abs() < EPS);
    }

    #[test]
    fn test_t_quantile_saturates_at_normal_limit() {
        assert!(t_quantile(999) > 1.645);
        assert_eq!(t_quantile(1000), 1.645);
        assert_eq!(t_quantile(1_000_000), 1.645);
    }

    #[test]
    fn test_t_quantile_non_increasing() {
        let mut previous = t_quantile(1);
        for dof in 2..3000 {
            let t = t_quantile(dof);
            assert!(t <= previous + EPS, "t({dof}) = {t} rose above {previous}");
            previous = t;
        }
    }

    #[test]
    fn test_aggregate_uses_bessel_correction() {
        let stat = AggregateStat::from_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert!((stat.mean - 2.5).abs() < EPS);
        assert!((stat.std_dev - (5.0f64 / 3.0).sqrt()).abs() < EPS);

        let single = AggregateStat::from_samples(&[7.0]);
        assert_eq!(single, AggregateStat { mean: 7.0, std_dev: 0.0 });
        assert_eq!(AggregateStat::from_samples(&[]), AggregateStat::default());
    }

    #[test]
    fn test_constant_batches_have_zero_spread() {
        for &t in &[1e-1, 7e-1, 3.3e-5, 1.234567e-6] {
            for &repeat in &[2usize, 3, 7, 150] {
                let stat = AggregateStat::from_samples(&vec![t; repeat]);
                assert_eq!(stat.mean, t, "t={t} repeat={repeat}");
                assert_eq!(stat.std_dev, 0.0, "t={t} repeat={repeat}");
                assert_eq!(ConfidenceInterval::of_mean(stat.std_dev, repeat).half_width(), 0.0);
                assert_eq!(
                    ConfidenceInterval::of_difference(stat.std_dev, stat.std_dev, repeat).half_width(),
                    0.0
                );
            }
        }
    }

    #[test]
    fn test_constant_batches_are_accepted_first_time() {
        let constant = AggregateStat::from_samples(&vec![7e-1; 150]);
        let idle = AggregateStat::from_samples(&vec![0.0; 150]);
        let estimate = TransferEstimate::compute(1 << 20, constant, idle, constant, 150);
        assert_eq!(estimate.ci_time, 0.0);
        assert_eq!(
            RerunPolicy::default().decide(estimate.ci_time, estimate.adjusted_time, 0),
            Decision::Accept { forced: false }
        );
    }

    #[test]
    fn test_averaged_over_group() {
        let sum = AggregateStat { mean: 6.0, std_dev: 3.0 };
        assert_eq!(sum.averaged_over(3), AggregateStat { mean: 2.0, std_dev: 1.0 });
    }

    #[test]
    fn test_confidence_interval_formulas() {
        let mean = ConfidenceInterval::of_mean(2.0, 4).half_width();
        assert!((mean - 2.0 * 2.132 * 0.5).abs() < EPS);

        let diff = ConfidenceInterval::of_difference(3.0, 4.0, 4).half_width();
        let expected = 1.955 * (0.5f64 * 25.0).sqrt() * (0.5f64).sqrt();
        assert!((diff - expected).abs() < 1e-9, "{diff} vs {expected}");
    }

    #[test]
    fn test_estimate_bandwidth_and_adjusted_time() {
        let receiver = AggregateStat { mean: 3e-3, std_dev: 1e-5 };
        let compute = AggregateStat { mean: 1e-3, std_dev: 1e-5 };
        let sender = AggregateStat { mean: 2.5e-3, std_dev: 2e-5 };
        let estimate = TransferEstimate::compute(8_000_000, sender, compute, receiver, 10);
        assert!((estimate.adjusted_time - 2e-3).abs() < EPS);
        assert!((estimate.bandwidth_gbps - 4.0).abs() < 1e-9);
        assert!(estimate.relative_half_width() < 0.05);
    }

    #[test]
    fn test_rerun_threshold_is_strict() {
        let policy = RerunPolicy { threshold: 0.05, max_rerun: 50 };
        assert_eq!(policy.decide(0.5, 10.0, 0), Decision::Accept { forced: false });
        assert_eq!(policy.decide(0.51, 10.0, 0), Decision::Rerun);
        assert_eq!(policy.decide(0.1, 10.0, 3), Decision::Accept { forced: false });
    }

    #[test]
    fn test_rerun_capped() {
        let policy = RerunPolicy { threshold: 0.05, max_rerun: 50 };
        assert_eq!(policy.decide(5.0, 1.0, 48), Decision::Rerun);
        assert_eq!(policy.decide(5.0, 1.0, 49), Decision::Accept { forced: true });

        let attempts = (0..)
            .take_while(|&rerun| policy.decide(5.0, 1.0, rerun) == Decision::Rerun)
            .count()
            + 1;
        assert_eq!(attempts, 50, "never more than max_rerun batches");
    }

    #[test]
    fn test_zero_time_is_not_rerun() {
        let policy = RerunPolicy::default();
        assert_eq!(policy.decide(0.0, 0.0, 0), Decision::Accept { forced: false });
    }
}
