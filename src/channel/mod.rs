//! Interactive channel sessions.
//!
//! A session owns one pseudo-terminal bound to a child process (an SSH
//! client or a reverse-shell listener) and turns its byte stream into
//! request/response commands via marker framing.
//!
//! Layout:
//! - `transcript`: pure parsing of raw channel bytes.
//! - `frame`: the async frame driver over any [`ChannelIo`].
//! - `pty`: `portable-pty` backed channel.
//! - `monitor`: background connection monitor and `/proc/net/tcp` probes.
//! - `ssh` / `reverse`: the two session variants.
//! - `payload`: reverse-shell one-liner generator.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::config::FrameConfig;
use crate::error::SessionError;

pub mod frame;
pub mod monitor;
pub mod payload;
pub mod pty;
pub mod reverse;
pub mod ssh;
pub mod transcript;

pub use frame::{run_frame, ChannelIo, FrameOutput, ReadOutcome};
pub use monitor::MonitorHandle;
pub use pty::{PtyChannel, PtyCommand};
pub use reverse::ReverseShellSession;
pub use ssh::{SshSession, SshTarget};
pub use transcript::ScanMode;

/// Which variant a session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Ssh,
    ReverseShell,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::ReverseShell => "reverse_shell",
        }
    }
}

/// Output of one framed session command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub output: String,
    pub timed_out: bool,
    pub execution_time: f64,
}

impl From<FrameOutput> for CommandOutput {
    fn from(frame: FrameOutput) -> Self {
        Self {
            output: frame.output(),
            timed_out: frame.timed_out,
            execution_time: frame.elapsed.as_secs_f64(),
        }
    }
}

/// Decision-ready result of `send_command`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandResponse {
    pub success: bool,
    pub output: String,
    pub execution_time: f64,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<CommandOutput, SessionError>> for CommandResponse {
    fn from(result: Result<CommandOutput, SessionError>) -> Self {
        match result {
            Ok(out) => Self {
                // A timeout with partial output is still a usable answer.
                success: !out.timed_out || !out.output.trim().is_empty(),
                output: out.output,
                execution_time: out.execution_time,
                timed_out: out.timed_out,
                error: None,
            },
            Err(err) => Self {
                error: Some(err.to_string()),
                ..Self::default()
            },
        }
    }
}

/// Snapshot reported by `status()`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub kind: SessionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listener: Option<String>,
    pub connected: bool,
    pub process_alive: bool,
    pub monitor_active: bool,
    /// Unix seconds.
    pub start_time: u64,
    pub uptime_secs: f64,
    pub command_count: u64,
}

/// Anything that can run one framed command.
///
/// The transfer engine only needs this, which lets tests drive it with an
/// in-memory shell.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn exec_frame(
        &self,
        command: &str,
        timeout: Duration,
        mode: ScanMode,
    ) -> Result<FrameOutput, SessionError>;
}

/// A live interactive session (SSH or reverse shell).
#[async_trait]
pub trait ChannelSession: CommandChannel {
    fn session_id(&self) -> &str;
    fn kind(&self) -> SessionKind;
    fn is_connected(&self) -> bool;
    async fn send_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError>;
    fn status(&self) -> SessionStatus;
    /// Idempotent teardown; always leaves the session disconnected.
    async fn stop(&self);
}

// ---------------------------------------------------------------------------
// FramedChannel
// ---------------------------------------------------------------------------

/// Channel I/O plus the per-channel command lock.
///
/// The shared stream cannot be interleaved, so every frame holds the lock
/// for its whole duration.
#[derive(Debug)]
pub struct FramedChannel<C> {
    io: Arc<C>,
    timing: FrameConfig,
    command_lock: tokio::sync::Mutex<()>,
}

impl<C: ChannelIo> FramedChannel<C> {
    pub fn new(io: C, timing: FrameConfig) -> Self {
        Self {
            io: Arc::new(io),
            timing,
            command_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn io(&self) -> &Arc<C> {
        &self.io
    }

    pub fn timing(&self) -> &FrameConfig {
        &self.timing
    }

    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
        mode: ScanMode,
    ) -> Result<FrameOutput, SessionError> {
        let _guard = self.command_lock.lock().await;
        run_frame(&*self.io, &self.timing, command, timeout, mode).await
    }
}

#[async_trait]
impl<C: ChannelIo> CommandChannel for FramedChannel<C> {
    async fn exec_frame(
        &self,
        command: &str,
        timeout: Duration,
        mode: ScanMode,
    ) -> Result<FrameOutput, SessionError> {
        self.run(command, timeout, mode).await
    }
}

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

/// State shared by both session variants.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub(crate) id: String,
    pub(crate) channel: FramedChannel<PtyChannel>,
    pub(crate) connected: Arc<AtomicBool>,
    stopped: AtomicBool,
    monitor: Mutex<Option<MonitorHandle>>,
    command_count: AtomicU64,
    started_unix: u64,
    started: Instant,
    kill_grace: Duration,
}

impl SessionCore {
    pub(crate) fn new(
        id: String,
        channel: FramedChannel<PtyChannel>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            id,
            channel,
            connected: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            monitor: Mutex::new(None),
            command_count: AtomicU64::new(0),
            started_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            started: Instant::now(),
            kill_grace,
        }
    }

    pub(crate) fn pty(&self) -> &Arc<PtyChannel> {
        self.channel.io()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn attach_monitor(&self, handle: MonitorHandle) {
        if let Ok(mut slot) = self.monitor.lock() {
            *slot = Some(handle);
        }
    }

    fn monitor_active(&self) -> bool {
        self.monitor
            .lock()
            .map(|slot| slot.as_ref().is_some_and(MonitorHandle::is_active))
            .unwrap_or(false)
    }

    /// Run a framed command on behalf of a caller.
    pub(crate) async fn command(
        &self,
        command: &str,
        timeout: Duration,
        mode: ScanMode,
    ) -> Result<FrameOutput, SessionError> {
        if self.is_stopped() {
            return Err(SessionError::Stopped);
        }
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        self.command_count.fetch_add(1, Ordering::Relaxed);
        let result = self.channel.run(command, timeout, mode).await;
        if let Err(SessionError::ConnectionLost(reason)) = &result {
            tracing::warn!(session = %self.id, %reason, "channel lost during command");
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Base status; variants fill in their descriptor fields.
    pub(crate) fn status(&self, kind: SessionKind) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            kind,
            target: None,
            username: None,
            listen_port: None,
            listener: None,
            connected: self.is_connected(),
            process_alive: self.pty().is_alive(),
            monitor_active: self.monitor_active(),
            start_time: self.started_unix,
            uptime_secs: self.started.elapsed().as_secs_f64(),
            command_count: self.command_count.load(Ordering::Relaxed),
        }
    }

    /// Stop the monitor and terminate the child. Returns false if a previous
    /// call already did the work.
    pub(crate) async fn stop(&self) -> bool {
        self.connected.store(false, Ordering::SeqCst);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        let monitor = self.monitor.lock().ok().and_then(|mut slot| slot.take());
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        self.pty().terminate(self.kill_grace).await;
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(session = %self.id, "session stopped");
        true
    }
}
