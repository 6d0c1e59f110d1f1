//! Result persistence: one CSV file per strategy configuration, written by
//! rank 0, and an optional JSON summary of the whole run.

use crate::cli::StrategyKind;
use crate::error::BenchError;
use crate::metrics::RoundDistribution;
use crate::stats::TransferEstimate;
use crate::utils::format_scientific;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

/// One accepted payload size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub size_bytes: usize,
    pub sender_time: f64,
    pub receiver_time: f64,
    pub compute_time: f64,
    pub adjusted_time: f64,
    pub ci_sender: f64,
    pub ci_receiver: f64,
    pub ci_compute: f64,
    pub ci_time: f64,
    pub bandwidth_gbps: f64,
    /// Batches discarded before this one was accepted.
    pub reruns: usize,
    /// Accepted only because the rerun budget ran out.
    pub forced: bool,
    /// Distribution of rank 0's measured rounds in the accepted batch.
    pub distribution: RoundDistribution,
}

impl BenchmarkRecord {
    pub fn from_estimate(
        estimate: &TransferEstimate,
        reruns: usize,
        forced: bool,
        distribution: RoundDistribution,
    ) -> Self {
        Self {
            size_bytes: estimate.size_bytes,
            sender_time: estimate.sender.mean,
            receiver_time: estimate.receiver.mean,
            compute_time: estimate.compute.mean,
            adjusted_time: estimate.adjusted_time,
            ci_sender: estimate.ci_sender,
            ci_receiver: estimate.ci_receiver,
            ci_compute: estimate.ci_compute,
            ci_time: estimate.ci_time,
            bandwidth_gbps: estimate.bandwidth_gbps,
            reruns,
            forced,
            distribution,
        }
    }

    /// `size,sender,receiver,compute,time,ci_sender,ci_receiver,ci_compute,ci_time`
    pub fn to_csv_line(&self) -> String {
        let columns = [
            self.sender_time,
            self.receiver_time,
            self.compute_time,
            self.adjusted_time,
            self.ci_sender,
            self.ci_receiver,
            self.ci_compute,
            self.ci_time,
        ];
        let mut line = self.size_bytes.to_string();
        for value in columns {
            line.push(',');
            line.push_str(&format_scientific(value));
        }
        line
    }
}

/// Per-configuration result file, truncated on creation and appended to
/// once per accepted size.
pub struct ResultSink {
    path: PathBuf,
    file: File,
}

impl ResultSink {
    pub fn create(results_dir: &Path, file_name: &str) -> Result<Self, BenchError> {
        std::fs::create_dir_all(results_dir)?;
        let path = results_dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!("Writing results to {:?}", path);
        Ok(Self { path, file })
    }

    pub fn append(&mut self, record: &BenchmarkRecord) -> Result<(), BenchError> {
        writeln!(self.file, "{}", record.to_csv_line())?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Every record of one strategy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRun {
    pub strategy: StrategyKind,
    pub threads: usize,
    pub partitions: usize,
    pub noise_level: u32,
    pub layout: String,
    pub output_file: PathBuf,
    pub records: Vec<BenchmarkRecord>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StrategyRun {
    /// Highest bandwidth among the accepted sizes.
    pub fn peak_bandwidth_gbps(&self) -> Option<f64> {
        self.records
            .iter()
            .map(|record| record.bandwidth_gbps)
            .filter(|bandwidth| bandwidth.is_finite())
            .reduce(f64::max)
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub physical_cores: usize,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            physical_cores: num_cpus::get_physical(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Collects every strategy run and writes the JSON summary
pub struct ResultsManager {
    output_file: Option<PathBuf>,
    run_id: Uuid,
    runs: Vec<StrategyRun>,
}

impl ResultsManager {
    /// `output_file` of `None` keeps runs in memory only.
    pub fn new(output_file: Option<&Path>) -> Self {
        Self {
            output_file: output_file.map(Path::to_path_buf),
            run_id: Uuid::new_v4(),
            runs: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn runs(&self) -> &[StrategyRun] {
        &self.runs
    }

    pub fn add_run(&mut self, run: StrategyRun) {
        info!(
            "Recorded {} sizes for {} ({} threads, {} partitions, noise {})",
            run.records.len(),
            run.strategy,
            run.threads,
            run.partitions,
            run.noise_level
        );
        self.runs.push(run);
    }

    /// Writes the summary if an output file was requested.
    pub fn finalize(&self) -> Result<()> {
        let Some(output_file) = &self.output_file else {
            return Ok(());
        };
        info!("Finalizing benchmark results");

        let summary = RunSummary {
            metadata: BenchmarkMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.to_string(),
                timestamp: chrono::Utc::now(),
                total_runs: self.runs.len(),
                system_info: SystemInfo::default(),
            },
            peaks: self.peak_bandwidths(),
            runs: self.runs.clone(),
        };

        if let Some(parent) = output_file.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(output_file, json)
            .with_context(|| format!("failed to write summary to {}", output_file.display()))?;

        info!("Results written to: {:?}", output_file);
        Ok(())
    }

    /// Best bandwidth per strategy across every configuration.
    fn peak_bandwidths(&self) -> HashMap<String, f64> {
        let mut peaks: HashMap<String, f64> = HashMap::new();
        for run in &self.runs {
            if let Some(peak) = run.peak_bandwidth_gbps() {
                let best = peaks.entry(run.strategy.output_prefix().to_string()).or_insert(peak);
                *best = best.max(peak);
            }
        }
        peaks
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub metadata: BenchmarkMetadata,
    /// Peak bandwidth in GB/s, keyed by strategy prefix.
    pub peaks: HashMap<String, f64>,
    pub runs: Vec<StrategyRun>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_runs: usize,
    pub system_info: SystemInfo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::AggregateStat;
    use tempfile::TempDir;

    fn record(size_bytes: usize, bandwidth_gbps: f64) -> BenchmarkRecord {
        BenchmarkRecord {
            size_bytes,
            sender_time: 1.5e-5,
            receiver_time: 2.0e-5,
            compute_time: 0.0,
            adjusted_time: 2.0e-5,
            ci_sender: 1.0e-7,
            ci_receiver: 2.0e-7,
            ci_compute: 0.0,
            ci_time: 1.25e-7,
            bandwidth_gbps,
            reruns: 0,
            forced: false,
            distribution: RoundDistribution::default(),
        }
    }

    fn run(strategy: StrategyKind, bandwidths: &[f64]) -> StrategyRun {
        StrategyRun {
            strategy,
            threads: 1,
            partitions: 4,
            noise_level: 0,
            layout: "contiguous".into(),
            output_file: PathBuf::from("x.txt"),
            records: bandwidths.iter().map(|&bw| record(128, bw)).collect(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_csv_line_layout() {
        assert_eq!(
            record(128, 1.0).to_csv_line(),
            "128,1.500000e-05,2.000000e-05,0.000000e+00,2.000000e-05,1.000000e-07,2.000000e-07,0.000000e+00,1.250000e-07"
        );
    }

    #[test]
    fn test_record_from_estimate() {
        let stat = |mean: f64| AggregateStat { mean, std_dev: 0.0 };
        let estimate = TransferEstimate::compute(1000, stat(1.0), stat(0.5), stat(2.0), 10);
        let record = BenchmarkRecord::from_estimate(&estimate, 3, true, RoundDistribution::default());
        assert_eq!(record.size_bytes, 1000);
        assert_eq!(record.adjusted_time, 1.5);
        assert_eq!(record.compute_time, 0.5);
        assert_eq!(record.reruns, 3);
        assert!(record.forced);
    }

    #[test]
    fn test_sink_truncates_then_appends() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("out");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("bw.txt"), "stale\n").unwrap();

        let mut sink = ResultSink::create(&nested, "bw.txt").unwrap();
        sink.append(&record(64, 1.0)).unwrap();
        sink.append(&record(128, 1.0)).unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("64,"));
        assert!(lines[1].starts_with("128,"));
    }

    #[test]
    fn test_summary_written_with_peaks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("summary.json");
        let mut manager = ResultsManager::new(Some(&path));
        manager.add_run(run(StrategyKind::Single, &[1.0, 3.0]));
        manager.add_run(run(StrategyKind::Single, &[2.0]));
        manager.add_run(run(StrategyKind::RmaFence, &[0.5]));
        manager.finalize().unwrap();

        let summary: RunSummary = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(summary.metadata.total_runs, 3);
        assert_eq!(summary.metadata.run_id, manager.run_id().to_string());
        assert_eq!(summary.peaks["bw_single"], 3.0);
        assert_eq!(summary.peaks["bw_rma_fence"], 0.5);
        assert_eq!(summary.runs[0].records.len(), 2);
    }

    #[test]
    fn test_in_memory_manager_writes_nothing() {
        let mut manager = ResultsManager::new(None);
        manager.add_run(run(StrategyKind::Multi, &[]));
        assert!(manager.finalize().is_ok());
        assert_eq!(manager.runs()[0].peak_bandwidth_gbps(), None);
    }
}
