//! In-process transfer statistics.

use serde::Serialize;
use std::sync::Mutex;

use super::strategy::round2;
use super::TransferReport;

const MIB: f64 = 1024.0 * 1024.0;
/// How many recent transfers the report lists.
const RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone)]
struct Sample {
    label: String,
    success: bool,
    bytes: u64,
    duration_secs: f64,
}

/// Thread-safe recorder fed with finished transfer reports.
#[derive(Debug, Default)]
pub struct TransferStats {
    samples: Mutex<Vec<Sample>>,
}

/// Aggregate view over recorded transfers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_transfers: usize,
    pub successful_transfers: usize,
    /// Percent, two decimals.
    pub success_rate: f64,
    pub average_duration_secs: f64,
    pub total_mb_transferred: f64,
    pub average_throughput_mbps: f64,
    pub recent_transfers: Vec<String>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: &TransferReport) {
        let label = format!(
            "{}:{}",
            report.direction.map(|d| d.as_str()).unwrap_or("transfer"),
            report.path
        );
        let sample = Sample {
            label,
            success: report.success,
            bytes: report.file_size,
            duration_secs: report.duration_secs,
        };
        match self.samples.lock() {
            Ok(mut samples) => samples.push(sample),
            Err(poisoned) => poisoned.into_inner().push(sample),
        }
    }

    pub fn report(&self) -> PerformanceReport {
        let samples = match self.samples.lock() {
            Ok(samples) => samples.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if samples.is_empty() {
            return PerformanceReport::default();
        }
        let total = samples.len();
        let successful = samples.iter().filter(|s| s.success).count();
        let average_duration =
            samples.iter().map(|s| s.duration_secs).sum::<f64>() / total as f64;
        let total_bytes: u64 = samples.iter().map(|s| s.bytes).sum();
        // Total bytes over the mean duration.
        let throughput = if average_duration > 0.0 {
            total_bytes as f64 / average_duration / MIB
        } else {
            0.0
        };
        PerformanceReport {
            total_transfers: total,
            successful_transfers: successful,
            success_rate: round2(successful as f64 / total as f64 * 100.0),
            average_duration_secs: round2(average_duration),
            total_mb_transferred: round2(total_bytes as f64 / MIB),
            average_throughput_mbps: round2(throughput),
            recent_transfers: samples
                .iter()
                .rev()
                .take(RECENT_LIMIT)
                .rev()
                .map(|s| s.label.clone())
                .collect(),
        }
    }
}
