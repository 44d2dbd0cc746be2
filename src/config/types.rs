//! Configuration data model.
//!
//! Struct/enum definitions plus default values. Source discovery and env
//! overrides live in sibling modules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::defaults::*;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub executor: ExecutorConfig,
    pub tools: ToolsConfig,
    pub ssh: SshConfig,
    pub reverse_shell: ReverseShellConfig,
    pub transfer: TransferConfig,
    pub frame: FrameConfig,
}

/// One-shot command executor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard timeout for tools without a `[tools.timeouts]` entry.
    pub default_timeout_secs: u64,
    /// Silence window (no output at all) before a streamed command is
    /// declared blocking. Must be within 1..=30.
    pub blocking_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub kill_grace_secs: u64,
    /// When set, a timed-out command never reports success even with output.
    pub strict_timeouts: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_EXEC_TIMEOUT_SECS,
            blocking_timeout_secs: DEFAULT_BLOCKING_TIMEOUT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            kill_grace_secs: DEFAULT_EXEC_KILL_GRACE_SECS,
            strict_timeouts: false,
        }
    }
}

impl ExecutorConfig {
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.blocking_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Static tool policy tables keyed by executable name.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tools rejected by the executor; use a session instead.
    pub blocked: Vec<String>,
    /// Tools whose output is forwarded line by line.
    pub streaming: Vec<String>,
    /// Per-tool hard timeouts in seconds.
    pub timeouts: BTreeMap<String, u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            blocked: default_blocked_tools(),
            streaming: default_streaming_tools(),
            timeouts: default_tool_timeouts(),
        }
    }
}

/// SSH session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// SSH client binary spawned on the pseudo-terminal.
    pub program: String,
    pub connect_timeout_secs: u64,
    /// Delay between spawn and the connection canary.
    pub settle_ms: u64,
    pub canary_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub kill_grace_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_SSH_PROGRAM.to_string(),
            connect_timeout_secs: DEFAULT_SSH_CONNECT_TIMEOUT_SECS,
            settle_ms: DEFAULT_SSH_SETTLE_MS,
            canary_timeout_secs: DEFAULT_SSH_CANARY_TIMEOUT_SECS,
            command_timeout_secs: DEFAULT_SSH_COMMAND_TIMEOUT_SECS,
            monitor_interval_secs: DEFAULT_SSH_MONITOR_INTERVAL_SECS,
            kill_grace_secs: DEFAULT_SESSION_KILL_GRACE_SECS,
        }
    }
}

/// Listener program used for reverse-shell sessions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    /// `nc -nvlp PORT`
    #[default]
    Netcat,
    /// `pwncat -l PORT`
    Pwncat,
    /// `reverse_shell.custom_program` with `{port}` substituted into its args.
    Custom,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netcat => "netcat",
            Self::Pwncat => "pwncat",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for ListenerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "netcat" | "nc" => Ok(Self::Netcat),
            "pwncat" => Ok(Self::Pwncat),
            "custom" => Ok(Self::Custom),
            other => Err(format!(
                "unknown listener `{other}` (expected netcat, pwncat or custom)"
            )),
        }
    }
}

/// Reverse-shell listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReverseShellConfig {
    pub listener: ListenerKind,
    pub custom_program: Option<String>,
    /// Arguments for the custom listener; `{port}` is replaced.
    pub custom_args: Vec<String>,
    pub command_timeout_secs: u64,
    /// Monitor cadence while waiting for the first peer connection.
    pub connect_poll_ms: u64,
    /// Monitor cadence once connected, to notice the peer dropping.
    pub disconnect_poll_ms: u64,
    /// Delay after spawn before checking the listener is still alive.
    pub spawn_check_ms: u64,
    pub kill_grace_secs: u64,
    /// Run `fuser -k PORT/tcp` on stop so the port is immediately reusable.
    pub force_port_cleanup: bool,
}

impl Default for ReverseShellConfig {
    fn default() -> Self {
        Self {
            listener: ListenerKind::default(),
            custom_program: None,
            custom_args: Vec::new(),
            command_timeout_secs: DEFAULT_SHELL_COMMAND_TIMEOUT_SECS,
            connect_poll_ms: DEFAULT_CONNECT_POLL_MS,
            disconnect_poll_ms: DEFAULT_DISCONNECT_POLL_MS,
            spawn_check_ms: DEFAULT_SPAWN_CHECK_MS,
            kill_grace_secs: DEFAULT_SESSION_KILL_GRACE_SECS,
            force_port_cleanup: true,
        }
    }
}

/// Transfer engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub single_command_max_bytes: u64,
    pub streaming_max_bytes: u64,
    pub chunk_chars: usize,
    pub command_timeout_secs: u64,
    pub checksum_timeout_secs: u64,
    /// Server-side scratch directory for chunked transfers.
    pub remote_temp_dir: String,
    /// Remove the uploaded remote file when checksums disagree.
    pub remove_remote_on_mismatch: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            single_command_max_bytes: DEFAULT_SINGLE_COMMAND_MAX_BYTES,
            streaming_max_bytes: DEFAULT_STREAMING_MAX_BYTES,
            chunk_chars: DEFAULT_CHUNK_CHARS,
            command_timeout_secs: DEFAULT_TRANSFER_COMMAND_TIMEOUT_SECS,
            checksum_timeout_secs: DEFAULT_CHECKSUM_TIMEOUT_SECS,
            remote_temp_dir: DEFAULT_REMOTE_TEMP_DIR.to_string(),
            remove_remote_on_mismatch: true,
        }
    }
}

impl TransferConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn checksum_timeout(&self) -> Duration {
        Duration::from_secs(self.checksum_timeout_secs.max(1))
    }
}

/// Marker-frame protocol timing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    /// Pause between writing the command and its end-marker echo.
    pub settle_ms: u64,
    /// Re-poll cadence of the framed read loop.
    pub poll_interval_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            settle_ms: DEFAULT_FRAME_SETTLE_MS,
            poll_interval_ms: DEFAULT_FRAME_POLL_INTERVAL_MS,
        }
    }
}

impl FrameConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

/// Diagnostics captured while resolving runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigDiagnostics {
    /// Human-readable notes about where config came from.
    pub notes: Vec<String>,
}

/// Configuration payload plus load-time diagnostics.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub diagnostics: ConfigDiagnostics,
}
