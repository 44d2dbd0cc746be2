//! SSH session variant.
//!
//! The external `ssh` client runs on a pseudo-terminal we own. A session is
//! only considered connected once a canary command round-trips through the
//! marker protocol; process liveness alone proves nothing about auth.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, SshConfig};
use crate::error::SessionError;

use super::frame::FrameOutput;
use super::monitor::{self, spawn_monitor, MonitorCadence, Probe};
use super::pty::{PtyChannel, PtyCommand};
use super::transcript::ScanMode;
use super::{
    ChannelSession, CommandChannel, CommandOutput, FramedChannel, SessionCore, SessionKind,
    SessionStatus,
};

const CANARY_TOKEN: &str = "CONNECTION_TEST";

/// Text in the first output that means the connection will never come up.
const EARLY_FAILURES: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "Could not resolve hostname",
    "No route to host",
];

/// Where and how to connect.
#[derive(Clone, Default)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_file: Option<PathBuf>,
    pub password: Option<String>,
}

impl std::fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("key_file", &self.key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SshTarget {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            ..Self::default()
        }
    }

    /// Parse `user@host` or `user@host:port`.
    pub fn parse(spec: &str) -> Option<Self> {
        let (username, rest) = spec.split_once('@')?;
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (rest, 22),
        };
        if username.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self {
            port,
            ..Self::new(host, username)
        })
    }

    pub fn display(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Build the client invocation. A key file wins over a password; a password
/// travels through `SSHPASS` so it never shows up on argv.
pub fn ssh_command(config: &SshConfig, target: &SshTarget) -> PtyCommand {
    let mut ssh_args = vec![
        "-tt".to_string(),
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        "UserKnownHostsFile=/dev/null".into(),
        "-o".into(),
        format!("ConnectTimeout={}", config.connect_timeout_secs),
    ];
    if let Some(key) = &target.key_file {
        ssh_args.push("-i".into());
        ssh_args.push(key.display().to_string());
    }
    ssh_args.push("-p".into());
    ssh_args.push(target.port.to_string());
    ssh_args.push(format!("{}@{}", target.username, target.host));

    match (&target.key_file, &target.password) {
        (None, Some(password)) => PtyCommand::new("sshpass")
            .arg("-e")
            .arg(config.program.clone())
            .args(ssh_args)
            .env("SSHPASS", password.clone()),
        _ => PtyCommand::new(config.program.clone()).args(ssh_args),
    }
}

/// Find a line of early output that rules out a connection.
fn early_failure(output: &str) -> Option<&'static str> {
    EARLY_FAILURES
        .iter()
        .copied()
        .find(|needle| output.contains(needle))
}

/// One SSH session.
#[derive(Debug)]
pub struct SshSession {
    core: SessionCore,
    target: SshTarget,
    config: SshConfig,
}

impl SshSession {
    /// Spawn the client, verify it with the canary, then start monitoring.
    pub async fn start(
        session_id: &str,
        target: SshTarget,
        config: &Config,
    ) -> Result<Self, SessionError> {
        let ssh = config.ssh.clone();
        let command = ssh_command(&ssh, &target);
        let pty = PtyChannel::spawn(session_id, &command)?;
        let session = Self {
            core: SessionCore::new(
                session_id.to_string(),
                FramedChannel::new(pty, config.frame.clone()),
                Duration::from_secs(ssh.kill_grace_secs),
            ),
            target,
            config: ssh,
        };
        tracing::info!(session = %session_id, target = %session.target.display(), "starting ssh session");

        if let Err(err) = session.establish().await {
            tracing::warn!(session = %session_id, error = %err, "ssh session failed to establish");
            session.core.stop().await;
            return Err(err);
        }
        session.attach_monitor();
        Ok(session)
    }

    async fn establish(&self) -> Result<(), SessionError> {
        let early = self
            .core
            .pty()
            .collect_output(Duration::from_millis(self.config.settle_ms))
            .await;
        if let Some(reason) = early_failure(&early) {
            return Err(SessionError::ConnectionFailed(format!(
                "{}: {reason}",
                self.target.display()
            )));
        }
        if !self.core.pty().is_alive() {
            return Err(SessionError::ConnectionFailed(format!(
                "ssh client exited during connect to {}",
                self.target.display()
            )));
        }

        let canary = self
            .core
            .channel
            .run(
                &format!("echo '{CANARY_TOKEN}'"),
                Duration::from_secs(self.config.canary_timeout_secs),
                ScanMode::Lines,
            )
            .await
            .map_err(|e| SessionError::ConnectionFailed(format!("canary failed: {e}")))?;
        if !canary.lines.iter().any(|line| line.contains(CANARY_TOKEN)) {
            return Err(SessionError::ConnectionFailed(format!(
                "canary did not round-trip to {} (timed out: {})",
                self.target.display(),
                canary.timed_out
            )));
        }
        self.core
            .connected
            .store(true, std::sync::atomic::Ordering::SeqCst);
        tracing::info!(session = %self.core.id, "ssh canary succeeded");
        Ok(())
    }

    fn attach_monitor(&self) {
        let pty = Arc::clone(self.core.pty());
        let remote_port = self.target.port;
        let handle = spawn_monitor(
            self.core.id.clone(),
            Arc::clone(&self.core.connected),
            MonitorCadence::uniform(Duration::from_secs(self.config.monitor_interval_secs)),
            move || probe_ssh(&pty, remote_port),
        );
        self.core.attach_monitor(handle);
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }
}

/// Connected while the client lives and holds an established connection to
/// the remote port. Without readable socket tables, liveness is all we have.
fn probe_ssh(pty: &PtyChannel, remote_port: u16) -> Probe {
    if !pty.is_alive() || pty.is_closed() {
        return Probe::Gone;
    }
    let entries = monitor::read_tcp_tables();
    if entries.is_empty() {
        return Probe::Connected;
    }
    let owned = pty.pid().map(monitor::socket_inodes).unwrap_or_default();
    if monitor::outbound_established(&entries, remote_port, &owned) {
        Probe::Connected
    } else {
        Probe::Disconnected
    }
}

#[async_trait]
impl CommandChannel for SshSession {
    async fn exec_frame(
        &self,
        command: &str,
        timeout: Duration,
        mode: ScanMode,
    ) -> Result<FrameOutput, SessionError> {
        self.core.command(command, timeout, mode).await
    }
}

#[async_trait]
impl ChannelSession for SshSession {
    fn session_id(&self) -> &str {
        &self.core.id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::Ssh
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    async fn send_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, SessionError> {
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.command_timeout_secs));
        tracing::debug!(session = %self.core.id, "ssh command");
        self.core
            .command(command, timeout, ScanMode::Lines)
            .await
            .map(CommandOutput::from)
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            target: Some(format!("{}:{}", self.target.host, self.target.port)),
            username: Some(self.target.username.clone()),
            ..self.core.status(SessionKind::Ssh)
        }
    }

    async fn stop(&self) {
        self.core.stop().await;
    }
}
