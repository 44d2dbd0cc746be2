//! Unified error types for sessions, execution, and transfers.

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// ExecError
// ---------------------------------------------------------------------------

/// Errors from the one-shot command executor.
#[derive(Debug)]
pub enum ExecError {
    /// Command string was empty or whitespace.
    EmptyCommand,
    /// Leading tool is on the blocklist and must go through a session.
    Blocked { tool: String },
    /// The child process could not be started.
    Spawn(String),
    Io(std::io::Error),
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyCommand => write!(f, "command must not be empty"),
            Self::Blocked { tool } => write!(
                f,
                "The command '{tool}' is not allowed. Please use the appropriate manager (e.g., SSH Manager for ssh commands)."
            ),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for ExecError {}

impl From<std::io::Error> for ExecError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

// ---------------------------------------------------------------------------
// SessionError
// ---------------------------------------------------------------------------

/// Errors surfaced by channel sessions (SSH and reverse shell).
#[derive(Debug)]
pub enum SessionError {
    /// The session has no established peer yet.
    NotConnected,
    /// The channel closed underneath an in-flight command.
    ConnectionLost(String),
    /// Establishment failed (canary, early refusal, listener exit).
    ConnectionFailed(String),
    /// Session id or listen port already held by another session.
    ResourceConflict(String),
    /// No session is registered under this id.
    NotFound(String),
    /// Pseudo-terminal allocation or process spawn failed.
    Spawn(String),
    /// `stop()` already ran for this session.
    Stopped,
    Io(std::io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "session is not connected"),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            Self::ResourceConflict(msg) => write!(f, "resource conflict: {msg}"),
            Self::NotFound(id) => write!(f, "session `{id}` not found"),
            Self::Spawn(msg) => write!(f, "spawn failed: {msg}"),
            Self::Stopped => write!(f, "session has been stopped"),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl SessionError {
    /// Whether the caller may reasonably retry after fixing the peer side.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionLost(_) | Self::ConnectionFailed(_) | Self::Stopped
        )
    }
}

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors from the session registry and port ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateSession(String),
    PortInUse(u16),
    NotFound(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateSession(id) => write!(f, "session `{id}` already exists"),
            Self::PortInUse(port) => write!(f, "port {port} is already in use"),
            Self::NotFound(id) => write!(f, "session `{id}` not found"),
        }
    }
}

impl std::error::Error for RegistryError {}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id),
            other => Self::ResourceConflict(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// TransferError
// ---------------------------------------------------------------------------

/// Errors from the transfer engine.
///
/// A checksum mismatch is deliberately not represented here: it is a normal
/// outcome reported through `TransferReport`.
#[derive(Debug)]
pub enum TransferError {
    Session(SessionError),
    /// Caller-supplied content was not valid base64.
    InvalidBase64(String),
    /// Local path rejected by the safety check.
    UnsafePath(String),
    FileNotFound(String),
    /// No checksum tool produced a 64-hex digest.
    ChecksumUnavailable { command: String, output: String },
    /// Payload could not be isolated from channel noise.
    MalformedExtraction { command: String, partial: String },
    /// A remote step produced an error instead of data.
    RemoteCommandFailed { command: String, output: String },
    Io(std::io::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(e) => write!(f, "session: {e}"),
            Self::InvalidBase64(msg) => write!(f, "invalid base64 content: {msg}"),
            Self::UnsafePath(path) => write!(f, "unsafe path rejected: {path}"),
            Self::FileNotFound(path) => write!(f, "file not found: {path}"),
            Self::ChecksumUnavailable { command, output } => write!(
                f,
                "could not compute remote checksum (last command `{command}`, output: {})",
                diagnostic_excerpt(output)
            ),
            Self::MalformedExtraction { command, partial } => write!(
                f,
                "could not extract payload from output of `{command}` (partial: {})",
                diagnostic_excerpt(partial)
            ),
            Self::RemoteCommandFailed { command, output } => write!(
                f,
                "remote command `{command}` failed: {}",
                diagnostic_excerpt(output)
            ),
            Self::Io(e) => write!(f, "io: {e}"),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<SessionError> for TransferError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Bound raw channel output quoted in error messages.
fn diagnostic_excerpt(text: &str) -> String {
    const MAX_CHARS: usize = 200;
    let trimmed = text.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        return format!("{trimmed:?}");
    }
    let head: String = trimmed.chars().take(MAX_CHARS).collect();
    format!("{head:?}...")
}
