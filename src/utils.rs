//! # Utility Functions
//!
//! Formatting helpers for human-readable and machine-readable output,
//! configuration validators shared by every rank, and the thread pinning
//! helper used by worker teams.
//!
//! ```rust
//! use partcomm_benchmark::utils::*;
//! use std::time::Duration;
//!
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_rate(1048576.0), "1.00 MB/s");
//! assert_eq!(sweep_sizes(4, 32), vec![4, 8, 16, 32]);
//! ```

use crate::error::BenchError;
use std::time::Duration;
use tracing::warn;

/// Format a duration in a human-readable way
///
/// ## Examples
///
/// ```rust
/// # use partcomm_benchmark::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        if minutes < 60 {
            format!("{}m {}s", minutes, seconds % 60)
        } else {
            format!("{}h {}m {}s", minutes / 60, minutes % 60, seconds % 60)
        }
    }
}

/// Format a duration given in (possibly negative or non-finite) seconds.
pub fn format_seconds(seconds: f64) -> String {
    if seconds.is_finite() && seconds >= 0.0 {
        format_duration(Duration::from_secs_f64(seconds))
    } else {
        format!("{seconds:e}s")
    }
}

/// Format bytes with binary (1024-based) units
///
/// ```rust
/// # use partcomm_benchmark::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(2621440), "2.50 MB");
/// ```
pub fn format_bytes(bytes: usize) -> String {
    format_bytes_f64(bytes as f64)
}

pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a rate in bytes per second.
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// C-style `%e` rendering: six fractional digits, signed two-digit exponent.
///
/// ```rust
/// # use partcomm_benchmark::utils::format_scientific;
/// assert_eq!(format_scientific(1.5e-5), "1.500000e-05");
/// assert_eq!(format_scientific(123456.0), "1.234560e+05");
/// assert_eq!(format_scientific(0.0), "0.000000e+00");
/// ```
pub fn format_scientific(value: f64) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let rendered = format!("{:.6e}", value);
    match rendered.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{}e{}{:02}", mantissa, sign, exponent.abs())
        }
        None => rendered,
    }
}

/// Checks that the process group can be split into sender/receiver pairs.
pub fn validate_group_size(size: usize) -> Result<(), BenchError> {
    if size < 2 || size % 2 != 0 {
        return Err(BenchError::InvalidGroupSize(size));
    }
    Ok(())
}

/// Payload sizes in elements: `partitions`, doubling, up to `max_count`.
pub fn sweep_sizes(partitions: usize, max_count: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = partitions;
    while size > 0 && size <= max_count {
        sizes.push(size);
        size = match size.checked_mul(2) {
            Some(next) => next,
            None => break,
        };
    }
    sizes
}

/// Pins the calling thread to `core` (modulo the available cores).
///
/// Returns `false` when the platform refused or reported no cores.
pub fn pin_current_thread(core: usize) -> bool {
    let Some(cores) = core_affinity::get_core_ids().filter(|ids| !ids.is_empty()) else {
        warn!("No core ids available, worker threads are not pinned");
        return false;
    };
    core_affinity::set_for_current(cores[core % cores.len()])
}
