//! Default configuration constants and tool policy tables.
//!
//! Keeping defaults in one module lets the executor, sessions and transfer
//! engine share the same literals as the config loader.

use std::collections::BTreeMap;

/// Hard execution timeout for tools without a specific entry.
pub(super) const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 300;
/// Output-silence window before a streamed command is declared blocking.
pub(super) const DEFAULT_BLOCKING_TIMEOUT_SECS: u64 = 10;
/// Upper bound accepted for `blocking_timeout_secs`.
pub(super) const MAX_BLOCKING_TIMEOUT_SECS: u64 = 30;
pub(super) const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 1;
/// Grace window between SIGTERM and SIGKILL for executor children.
pub(super) const DEFAULT_EXEC_KILL_GRACE_SECS: u64 = 5;

pub(super) const DEFAULT_SSH_PROGRAM: &str = "ssh";
pub(super) const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(super) const DEFAULT_SSH_SETTLE_MS: u64 = 2000;
pub(super) const DEFAULT_SSH_CANARY_TIMEOUT_SECS: u64 = 10;
pub(super) const DEFAULT_SSH_COMMAND_TIMEOUT_SECS: u64 = 30;
pub(super) const DEFAULT_SSH_MONITOR_INTERVAL_SECS: u64 = 5;

pub(super) const DEFAULT_SHELL_COMMAND_TIMEOUT_SECS: u64 = 60;
pub(super) const DEFAULT_CONNECT_POLL_MS: u64 = 1000;
pub(super) const DEFAULT_DISCONNECT_POLL_MS: u64 = 5000;
pub(super) const DEFAULT_SPAWN_CHECK_MS: u64 = 500;

/// Session teardown grace between SIGTERM and SIGKILL.
pub(super) const DEFAULT_SESSION_KILL_GRACE_SECS: u64 = 3;

/// Decoded payload sizes below this use one inline command.
pub(super) const DEFAULT_SINGLE_COMMAND_MAX_BYTES: u64 = 50 * 1024;
/// Decoded payload sizes below this use heredoc streaming; at or above, chunks.
pub(super) const DEFAULT_STREAMING_MAX_BYTES: u64 = 500 * 1024;
/// Base64 characters per appended chunk (multiple of 4).
pub(super) const DEFAULT_CHUNK_CHARS: usize = 4000;
pub(super) const DEFAULT_TRANSFER_COMMAND_TIMEOUT_SECS: u64 = 120;
pub(super) const DEFAULT_CHECKSUM_TIMEOUT_SECS: u64 = 60;
pub(super) const DEFAULT_REMOTE_TEMP_DIR: &str = "/tmp";

pub(super) const DEFAULT_FRAME_SETTLE_MS: u64 = 200;
pub(super) const DEFAULT_FRAME_POLL_INTERVAL_MS: u64 = 1000;

/// Tools that open persistent interactive connections.
pub(super) fn default_blocked_tools() -> Vec<String> {
    ["ssh", "scp", "rsync", "nc", "netcat", "telnet"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Tools whose output is worth forwarding line by line.
pub(super) fn default_streaming_tools() -> Vec<String> {
    [
        "ffuf",
        "gobuster",
        "feroxbuster",
        "wfuzz",
        "dirsearch",
        "dirb",
        "nikto",
        "ping",
        "bash",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Tool-specific hard timeouts in seconds.
pub(super) fn default_tool_timeouts() -> BTreeMap<String, u64> {
    let mut timeouts = BTreeMap::new();
    for tool in [
        "ffuf",
        "gobuster",
        "feroxbuster",
        "wfuzz",
        "dirsearch",
        "nikto",
        "dirb",
    ] {
        timeouts.insert(tool.to_string(), 1800);
    }
    timeouts.insert("nmap".to_string(), 3600);
    timeouts
}
