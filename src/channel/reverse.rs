//! Reverse-shell session variant.
//!
//! A listener program (netcat, pwncat or a custom one) runs on a raw-mode
//! pseudo-terminal and waits for a target to connect back. Starting the
//! listener does not mean a shell exists: the monitor flips `connected` only
//! once an established inbound connection shows up on the listen port.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::{Config, ListenerKind, ReverseShellConfig};
use crate::error::SessionError;
use crate::exec::{run_process, ExecOptions, Executor};

use super::frame::FrameOutput;
use super::monitor::{self, spawn_monitor, MonitorCadence, Probe};
use super::pty::{PtyChannel, PtyCommand};
use super::transcript::ScanMode;
use super::{
    ChannelSession, CommandChannel, CommandOutput, FramedChannel, SessionCore, SessionKind,
    SessionStatus,
};

const CONNECTION_WAIT_POLL: Duration = Duration::from_millis(100);

/// Listener invocation for `kind` on `port`.
pub fn listener_command(
    config: &ReverseShellConfig,
    kind: ListenerKind,
    port: u16,
) -> Result<PtyCommand, SessionError> {
    let port_text = port.to_string();
    let command = match kind {
        ListenerKind::Netcat => PtyCommand::new("nc").arg("-nvlp").arg(port_text),
        ListenerKind::Pwncat => PtyCommand::new("pwncat").arg("-l").arg(port_text),
        ListenerKind::Custom => {
            let program = config.custom_program.clone().ok_or_else(|| {
                SessionError::Spawn(
                    "custom listener requires reverse_shell.custom_program".into(),
                )
            })?;
            PtyCommand::new(program).args(
                config
                    .custom_args
                    .iter()
                    .map(|arg| arg.replace("{port}", &port_text)),
            )
        }
    };
    Ok(command.raw())
}

/// One reverse-shell listener and, once a peer connects, its shell.
#[derive(Debug)]
pub struct ReverseShellSession {
    core: SessionCore,
    port: u16,
    listener: ListenerKind,
    config: ReverseShellConfig,
    executor: Executor,
    trigger: Mutex<Option<JoinHandle<()>>>,
}

impl ReverseShellSession {
    /// Probe the port, spawn the listener, and verify it survived startup.
    pub async fn start(
        session_id: &str,
        port: u16,
        listener: ListenerKind,
        config: &Config,
        executor: Executor,
    ) -> Result<Self, SessionError> {
        if monitor::port_in_use(port) {
            return Err(SessionError::ResourceConflict(format!(
                "port {port} is already in use"
            )));
        }
        let shell = config.reverse_shell.clone();
        let command = listener_command(&shell, listener, port)?;
        let pty = PtyChannel::spawn(session_id, &command)?;
        let session = Self {
            core: SessionCore::new(
                session_id.to_string(),
                FramedChannel::new(pty, config.frame.clone()),
                Duration::from_secs(shell.kill_grace_secs),
            ),
            port,
            listener,
            config: shell,
            executor,
            trigger: Mutex::new(None),
        };

        tokio::time::sleep(Duration::from_millis(session.config.spawn_check_ms)).await;
        if !session.core.pty().is_alive() {
            let output = session
                .core
                .pty()
                .collect_output(Duration::from_millis(100))
                .await;
            session.core.stop().await;
            let output = output.trim();
            tracing::warn!(session = %session_id, port, %output, "listener exited right after spawn");
            return Err(if output.contains("in use") {
                SessionError::ResourceConflict(format!("port {port} is already in use: {output}"))
            } else {
                SessionError::ConnectionFailed(format!(
                    "listener `{}` exited immediately: {output}",
                    command.display()
                ))
            });
        }

        session.attach_monitor();
        tracing::info!(session = %session_id, port, listener = listener.as_str(), "listener started");
        Ok(session)
    }

    fn attach_monitor(&self) {
        let pty = Arc::clone(self.core.pty());
        let port = self.port;
        let handle = spawn_monitor(
            self.core.id.clone(),
            Arc::clone(&self.core.connected),
            MonitorCadence {
                until_connected: Duration::from_millis(self.config.connect_poll_ms),
                while_connected: Duration::from_millis(self.config.disconnect_poll_ms),
            },
            move || probe_listener(&pty, port),
        );
        self.core.attach_monitor(handle);
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn listener(&self) -> ListenerKind {
        self.listener
    }

    /// Fire `command` in the background and return an acknowledgment
    /// immediately. A previous trigger still running is aborted.
    pub fn trigger(&self, command: &str, timeout: Duration) -> Result<String, SessionError> {
        if self.core.is_stopped() {
            return Err(SessionError::Stopped);
        }
        let executor = self.executor.clone();
        let command = command.to_string();
        let session = self.core.id.clone();
        let handle = tokio::spawn(async move {
            let options = ExecOptions {
                timeout: Some(timeout),
                ..ExecOptions::default()
            };
            match executor.execute_trusted(&command, options).await {
                Ok(result) => tracing::info!(
                    %session,
                    return_code = result.return_code,
                    timed_out = result.timed_out,
                    "trigger finished"
                ),
                Err(err) => tracing::warn!(%session, error = %err, "trigger failed"),
            }
        });
        if let Ok(mut slot) = self.trigger.lock() {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        }
        Ok(format!(
            "Trigger command started in background for session {}",
            self.core.id
        ))
    }

    /// Wait until the monitor reports a peer, up to `timeout`.
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.core.is_connected() {
                return true;
            }
            if self.core.is_stopped() || Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(CONNECTION_WAIT_POLL).await;
        }
    }
}

/// Connected while the listener lives and holds an accepted connection.
fn probe_listener(pty: &PtyChannel, port: u16) -> Probe {
    if !pty.is_alive() || pty.is_closed() {
        return Probe::Gone;
    }
    let entries = monitor::read_tcp_tables();
    let owned = pty.pid().map(monitor::socket_inodes).unwrap_or_default();
    if monitor::inbound_established(&entries, port, &owned) {
        Probe::Connected
    } else {
        Probe::Disconnected
    }
}

#[async_trait]
impl CommandChannel for ReverseShellSession {
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
impl ChannelSession for ReverseShellSession {
    fn session_id(&self) -> &str {
        &self.core.id
    }

    fn kind(&self) -> SessionKind {
        SessionKind::ReverseShell
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
        self.core
            .command(command, timeout, ScanMode::Lines)
            .await
            .map(CommandOutput::from)
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            listen_port: Some(self.port),
            listener: Some(self.listener.as_str().to_string()),
            ..self.core.status(SessionKind::ReverseShell)
        }
    }

    async fn stop(&self) {
        if let Ok(mut slot) = self.trigger.lock() {
            if let Some(trigger) = slot.take() {
                trigger.abort();
            }
        }
        if !self.core.stop().await {
            return;
        }
        if self.config.force_port_cleanup {
            // Best effort: frees the port from anything the listener forked.
            let target = format!("{}/tcp", self.port);
            match run_process("fuser", &["-k".to_string(), target]).await {
                Ok(out) => tracing::debug!(port = self.port, exit = out.exit_code, "fuser cleanup"),
                Err(err) => tracing::debug!(port = self.port, error = %err, "fuser unavailable"),
            }
        }
        self.core.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind(("0.0.0.0", 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("ephemeral port")
    }

    fn sleeper_config() -> Config {
        let mut config = Config::default();
        config.reverse_shell.listener = ListenerKind::Custom;
        config.reverse_shell.custom_program = Some("sleep".into());
        config.reverse_shell.custom_args = vec!["30".into()];
        config.reverse_shell.spawn_check_ms = 100;
        config.reverse_shell.connect_poll_ms = 50;
        config.reverse_shell.kill_grace_secs = 1;
        config.reverse_shell.force_port_cleanup = false;
        config
    }

    #[test]
    fn listener_commands_per_kind() {
        let config = ReverseShellConfig::default();
        let nc = listener_command(&config, ListenerKind::Netcat, 4444).unwrap();
        assert_eq!(nc.display(), "nc -nvlp 4444");
        assert!(nc.raw_mode);
        let pwncat = listener_command(&config, ListenerKind::Pwncat, 9001).unwrap();
        assert_eq!(pwncat.display(), "pwncat -l 9001");
    }

    #[test]
    fn custom_listener_substitutes_port() {
        let config = ReverseShellConfig {
            custom_program: Some("socat".into()),
            custom_args: vec!["TCP-LISTEN:{port},reuseaddr".into(), "STDIO".into()],
            ..ReverseShellConfig::default()
        };
        let command = listener_command(&config, ListenerKind::Custom, 5555).unwrap();
        assert_eq!(command.display(), "socat TCP-LISTEN:5555,reuseaddr STDIO");

        let err = listener_command(&ReverseShellConfig::default(), ListenerKind::Custom, 1)
            .unwrap_err();
        assert!(err.to_string().contains("custom_program"));
    }

    #[tokio::test]
    async fn occupied_port_is_rejected_before_spawn() {
        let holder = TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        let port = holder.local_addr().expect("addr").port();
        let err = ReverseShellSession::start(
            "busy",
            port,
            ListenerKind::Custom,
            &sleeper_config(),
            Executor::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::ResourceConflict(_)), "got: {err}");
    }

    #[tokio::test]
    async fn listener_waits_for_peer_and_stops_idempotently() {
        let port = free_port();
        let session = ReverseShellSession::start(
            "waiting",
            port,
            ListenerKind::Custom,
            &sleeper_config(),
            Executor::default(),
        )
        .await
        .expect("start listener");

        let status = session.status();
        assert!(!status.connected);
        assert!(status.process_alive);
        assert_eq!(status.listen_port, Some(port));
        assert_eq!(status.listener.as_deref(), Some("custom"));

        let err = session.send_command("id", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(!session.wait_for_connection(Duration::from_millis(200)).await);

        let ack = session
            .trigger("true", Duration::from_secs(5))
            .expect("trigger");
        assert!(ack.contains("background"));

        session.stop().await;
        session.stop().await;
        let status = session.status();
        assert!(!status.connected);
        assert!(!status.process_alive);
        assert!(!status.monitor_active);
        assert!(matches!(
            session.send_command("id", None).await,
            Err(SessionError::Stopped)
        ));
    }

    #[tokio::test]
    async fn listener_that_dies_on_spawn_is_a_connection_failure() {
        let mut config = sleeper_config();
        config.reverse_shell.custom_program = Some("false".into());
        config.reverse_shell.custom_args.clear();
        let err = ReverseShellSession::start(
            "dies",
            free_port(),
            ListenerKind::Custom,
            &config,
            Executor::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::ConnectionFailed(_)), "got: {err}");
    }
}
