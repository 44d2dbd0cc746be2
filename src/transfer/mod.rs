//! Checksum-verified file transfer.
//!
//! Two front ends share one report type:
//! - [`ChannelTransfer`] moves bytes through a framed channel session,
//!   choosing a wire strategy by size (`strategy`) and building the remote
//!   shell commands in `commands`.
//! - [`LocalTransfer`] moves files on this host with path-safety checks.
//!
//! In both, the only success criterion is equality of the source and target
//! SHA-256 digests. A mismatch is a normal report with `success = false`, not
//! an error, and it is never retried here.

use serde::Serialize;
use std::time::Instant;

use crate::error::TransferError;

pub mod checksum;
pub mod commands;
pub mod local;
pub mod remote;
pub mod stats;
pub mod strategy;

pub use checksum::{remote_checksum, sha256_file, sha256_hex};
pub use local::LocalTransfer;
pub use remote::{ChannelTransfer, Downloaded};
pub use stats::{PerformanceReport, TransferStats};
pub use strategy::{
    analyze_local, estimate_transfer, select_method, ChannelMethod, OptimizationLevel,
    TransportKind,
};

/// Output fragments that mean the remote path does not exist.
pub const FILE_NOT_FOUND_MARKERS: &[&str] =
    &["No such file or directory", "File not found", "does not exist"];

pub(crate) fn looks_like_missing_file(output: &str) -> bool {
    FILE_NOT_FOUND_MARKERS
        .iter()
        .any(|needle| output.contains(needle))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upload" => Ok(Self::Upload),
            "download" => Ok(Self::Download),
            other => Err(format!("unknown direction `{other}`")),
        }
    }
}

/// Method label for direct local transfers.
pub const DIRECT_METHOD: &str = "direct";

/// Outcome of one transfer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    pub method: String,
    pub file_size: u64,
    pub path: String,
    pub source_checksum: String,
    pub target_checksum: String,
    pub checksum_mismatch: bool,
    /// The corrupted target was deleted after a mismatch.
    pub artifact_removed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization_level: Option<OptimizationLevel>,
    pub chunks: u64,
    pub duration_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferReport {
    /// Build a report whose success is decided by the two digests.
    pub(crate) fn verified(
        direction: Direction,
        method: &str,
        path: &str,
        file_size: u64,
        source_checksum: String,
        target_checksum: String,
        started: Instant,
    ) -> Self {
        let matched = source_checksum == target_checksum;
        let error = (!matched).then(|| {
            format!(
                "checksum mismatch: source {source_checksum} != target {target_checksum}"
            )
        });
        Self {
            success: matched,
            direction: Some(direction),
            method: method.to_string(),
            file_size,
            path: path.to_string(),
            source_checksum,
            target_checksum,
            checksum_mismatch: !matched,
            artifact_removed: false,
            optimization_level: Some(OptimizationLevel::for_size(file_size)),
            chunks: 1,
            duration_secs: started.elapsed().as_secs_f64(),
            error,
        }
    }

    pub(crate) fn with_chunks(mut self, chunks: u64) -> Self {
        self.chunks = chunks;
        self
    }
}

impl From<Result<TransferReport, TransferError>> for TransferReport {
    fn from(result: Result<TransferReport, TransferError>) -> Self {
        match result {
            Ok(report) => report,
            Err(err) => Self {
                error: Some(err.to_string()),
                ..Self::default()
            },
        }
    }
}
