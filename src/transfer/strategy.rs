//! Size-driven strategy selection and transfer estimates.

use serde::Serialize;

use crate::config::TransferConfig;

use super::Direction;

const KIB: f64 = 1024.0;
const MIB: u64 = 1024 * 1024;

/// Below this size a local transfer is `small`.
pub const SMALL_FILE_THRESHOLD: u64 = MIB;
/// At or above this size a local transfer is `large`.
pub const LARGE_FILE_THRESHOLD: u64 = 50 * MIB;

/// Nominal channel throughput used by estimates.
const CHANNEL_THROUGHPUT_KBPS: f64 = 1000.0;
const CHANNEL_OVERHEAD_FACTOR: f64 = 1.2;
/// Checksum and verification time added to local estimates.
const VERIFICATION_OVERHEAD_SECS: f64 = 0.5;

/// Wire strategy for a transfer over a channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMethod {
    SingleCommand,
    Streaming,
    Chunked,
}

impl ChannelMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleCommand => "single_command",
            Self::Streaming => "streaming",
            Self::Chunked => "chunked",
        }
    }

    fn overhead_secs(self) -> f64 {
        match self {
            Self::SingleCommand => 1.0,
            Self::Streaming => 2.0,
            Self::Chunked => 3.0,
        }
    }
}

/// Pick the strategy for `size` decoded bytes. Thresholds are exclusive
/// upper bounds of the lower tier.
pub fn select_method(size: u64, config: &TransferConfig) -> ChannelMethod {
    if size < config.single_command_max_bytes {
        ChannelMethod::SingleCommand
    } else if size < config.streaming_max_bytes {
        ChannelMethod::Streaming
    } else {
        ChannelMethod::Chunked
    }
}

/// Size class used to tune local transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    Small,
    Medium,
    Large,
}

impl OptimizationLevel {
    pub fn for_size(size: u64) -> Self {
        if size < SMALL_FILE_THRESHOLD {
            Self::Small
        } else if size < LARGE_FILE_THRESHOLD {
            Self::Medium
        } else {
            Self::Large
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    fn base_chunk_size(self) -> usize {
        match self {
            Self::Small => 4096,
            Self::Medium => 32768,
            Self::Large => 131072,
        }
    }

    fn bytes_per_sec(self) -> f64 {
        match self {
            Self::Small => 512.0 * KIB,
            Self::Medium => 1024.0 * KIB,
            Self::Large => 2048.0 * KIB,
        }
    }
}

/// Transport a transfer travels over, for chunk sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Ssh,
    ReverseShell,
    Direct,
}

impl TransportKind {
    fn chunk_multiplier(self) -> f64 {
        match self {
            Self::Ssh => 1.0,
            // Smaller writes keep raw shells stable.
            Self::ReverseShell => 0.5,
            Self::Direct => 2.0,
        }
    }
}

pub fn chunk_size(size: u64, transport: TransportKind) -> usize {
    let base = OptimizationLevel::for_size(size).base_chunk_size() as f64;
    (base * transport.chunk_multiplier()) as usize
}

/// Channel transfer estimate.
#[derive(Debug, Clone, Serialize)]
pub struct TransferEstimate {
    pub file_size_bytes: u64,
    pub file_size_kb: f64,
    pub file_size_mb: f64,
    pub direction: Direction,
    pub recommended_method: ChannelMethod,
    pub estimated_time_secs: f64,
    pub estimated_throughput_kbps: f64,
    pub recommendations: Vec<String>,
}

pub fn estimate_transfer(
    size: u64,
    direction: Direction,
    config: &TransferConfig,
) -> TransferEstimate {
    let size_kb = size as f64 / KIB;
    let size_mb = size_kb / KIB;
    let method = select_method(size, config);
    let estimated =
        size_kb * CHANNEL_OVERHEAD_FACTOR / CHANNEL_THROUGHPUT_KBPS + method.overhead_secs();
    let recommendations = if size_mb > 10.0 {
        vec![
            "Compress files before transfer".to_string(),
            "Consider splitting large files".to_string(),
            "Use a direct local transfer when the file is on this host".to_string(),
        ]
    } else {
        Vec::new()
    };
    TransferEstimate {
        file_size_bytes: size,
        file_size_kb: round2(size_kb),
        file_size_mb: round2(size_mb),
        direction,
        recommended_method: method,
        estimated_time_secs: round2(estimated),
        estimated_throughput_kbps: CHANNEL_THROUGHPUT_KBPS,
        recommendations,
    }
}

/// Local transfer analysis.
#[derive(Debug, Clone, Serialize)]
pub struct LocalAnalysis {
    pub optimization_level: OptimizationLevel,
    pub chunk_size: usize,
    pub estimated_chunks: u64,
    pub estimated_time_secs: f64,
    pub content_size_mb: f64,
}

pub fn analyze_local(size: u64, transport: TransportKind) -> LocalAnalysis {
    let level = OptimizationLevel::for_size(size);
    let chunk = chunk_size(size, transport);
    let estimated_chunks = match level {
        OptimizationLevel::Small => 1,
        _ => size / chunk.max(1) as u64 + 1,
    };
    LocalAnalysis {
        optimization_level: level,
        chunk_size: chunk,
        estimated_chunks,
        estimated_time_secs: size as f64 / level.bytes_per_sec() + VERIFICATION_OVERHEAD_SECS,
        content_size_mb: round2(size as f64 / MIB as f64),
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
