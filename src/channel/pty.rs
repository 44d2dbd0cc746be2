//! Pseudo-terminal backed channel.
//!
//! The child (ssh client or listener) is attached to the slave side; we keep
//! the master. A dedicated reader thread turns blocking master reads into an
//! unbounded mpsc stream so [`ChannelIo::read_chunk`] can be a plain
//! timeout-bounded `select!` instead of a thread per read.

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::fmt;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::error::SessionError;
use crate::exec::signal_group;

use super::frame::{ChannelIo, ReadOutcome};

const READ_BUFFER_BYTES: usize = 8192;
/// Poll cadence while waiting for a terminated child to exit.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// Program and arguments to attach to a fresh pseudo-terminal.
#[derive(Clone, Default)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Extra environment; values are never logged.
    pub env: Vec<(String, String)>,
    /// Disable canonical mode and echo on the terminal.
    pub raw_mode: bool,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw_mode = true;
        self
    }

    /// Printable command line without environment values.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for PtyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("PtyCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &env_keys)
            .field("raw_mode", &self.raw_mode)
            .finish()
    }
}

/// One child process bound to a pseudo-terminal we own.
pub struct PtyChannel {
    label: String,
    pid: Option<u32>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    output: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for PtyChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtyChannel")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl PtyChannel {
    /// Allocate a terminal and spawn `command` on it.
    pub fn spawn(label: &str, command: &PtyCommand) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: 50,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(format!("failed to allocate PTY: {e}")))?;

        if command.raw_mode {
            set_raw_mode(pair.master.as_ref())?;
        }

        let mut builder = CommandBuilder::new(&command.program);
        for arg in &command.args {
            builder.arg(arg);
        }
        for (key, value) in &command.env {
            builder.env(key, value);
        }
        builder.env("TERM", "dumb");

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| SessionError::Spawn(format!("{}: {e}", command.program)))?;
        // The child holds its own slave descriptor; ours would keep the
        // reader from ever seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(format!("failed to acquire PTY writer: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let thread_label = label.to_string();
        thread::Builder::new()
            .name(format!("shellrelay-pty-{label}"))
            .spawn(move || {
                let mut buf = vec![0u8; READ_BUFFER_BYTES];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        // EIO once the child side is gone.
                        Err(_) => break,
                    }
                }
                tracing::debug!(channel = %thread_label, "pty reader finished");
            })
            .map_err(|e| SessionError::Spawn(format!("failed to spawn PTY reader: {e}")))?;

        tracing::info!(channel = %label, ?pid, command = %command.display(), "spawned pty child");
        let (closed, _) = watch::channel(false);
        Ok(Self {
            label: label.to_string(),
            pid,
            writer: Arc::new(Mutex::new(writer)),
            output: tokio::sync::Mutex::new(rx),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            master: Mutex::new(Some(pair.master)),
            closed,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Whether the child has not exited yet.
    pub fn is_alive(&self) -> bool {
        match self.child.lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(_) => false,
        }
    }

    /// Collect whatever the child printed within `window`, without blocking
    /// past it. Used for early diagnostics right after spawn.
    pub async fn collect_output(&self, window: Duration) -> String {
        let deadline = Instant::now() + window;
        let mut collected = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.read_chunk(remaining).await {
                ReadOutcome::Data(bytes) => collected.extend_from_slice(&bytes),
                ReadOutcome::Idle | ReadOutcome::Closed => break,
            }
            if remaining.is_zero() {
                break;
            }
        }
        String::from_utf8_lossy(&collected).to_string()
    }

    /// Mark the channel closed and release the master descriptor.
    pub fn close(&self) {
        self.closed.send_replace(true);
        if let Ok(mut master) = self.master.lock() {
            master.take();
        }
    }

    /// SIGTERM the child's process group, wait up to `grace`, then kill.
    /// Always closes the channel.
    pub async fn terminate(&self, grace: Duration) {
        if let Some(pid) = self.pid {
            signal_group(pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while self.is_alive() && Instant::now() < deadline {
            tokio::time::sleep(EXIT_POLL).await;
        }
        if self.is_alive() {
            tracing::debug!(channel = %self.label, pid = ?self.pid, "child ignored SIGTERM; killing");
            if let Some(pid) = self.pid {
                signal_group(pid, libc::SIGKILL);
            }
            if let Ok(mut killer) = self.killer.lock() {
                let _ = killer.kill();
            }
            // Reap so the pid does not linger as a zombie.
            let reap_deadline = Instant::now() + Duration::from_secs(1);
            while self.is_alive() && Instant::now() < reap_deadline {
                tokio::time::sleep(EXIT_POLL).await;
            }
        }
        self.close();
    }
}

#[async_trait]
impl ChannelIo for PtyChannel {
    async fn write_all(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::ConnectionLost(format!(
                "channel `{}` is closed",
                self.label
            )));
        }
        let writer = Arc::clone(&self.writer);
        let bytes = data.to_vec();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut guard = writer
                .lock()
                .map_err(|_| std::io::Error::other("pty writer poisoned"))?;
            guard.write_all(&bytes)?;
            guard.flush()
        })
        .await
        .map_err(|e| SessionError::ConnectionLost(format!("pty write task failed: {e}")))?;
        result.map_err(|e| SessionError::ConnectionLost(format!("pty write failed: {e}")))
    }

    async fn read_chunk(&self, wait: Duration) -> ReadOutcome {
        if self.is_closed() {
            return ReadOutcome::Closed;
        }
        let mut output = self.output.lock().await;
        let first = if wait.is_zero() {
            match output.try_recv() {
                Ok(bytes) => bytes,
                Err(mpsc::error::TryRecvError::Empty) => return ReadOutcome::Idle,
                Err(mpsc::error::TryRecvError::Disconnected) => return ReadOutcome::Closed,
            }
        } else {
            let closed = self.closed.subscribe();
            tokio::select! {
                chunk = output.recv() => match chunk {
                    Some(bytes) => bytes,
                    None => return ReadOutcome::Closed,
                },
                _ = wait_closed(closed) => return ReadOutcome::Closed,
                _ = tokio::time::sleep(wait) => return ReadOutcome::Idle,
            }
        };
        // Coalesce whatever else is already queued.
        let mut data = first;
        while let Ok(more) = output.try_recv() {
            data.extend_from_slice(&more);
        }
        ReadOutcome::Data(data)
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

impl Drop for PtyChannel {
    fn drop(&mut self) {
        if let Ok(mut killer) = self.killer.lock() {
            let _ = killer.kill();
        }
    }
}

/// Put the terminal in raw mode so long lines are not cut at the canonical
/// line limit and nothing is echoed back.
fn set_raw_mode(master: &(dyn MasterPty + Send)) -> Result<(), SessionError> {
    let Some(fd) = master.as_raw_fd() else {
        return Ok(());
    };
    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    // SAFETY: `fd` is the open master descriptor owned by `master`, and the
    // termios struct is initialized by tcgetattr before use.
    unsafe {
        if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
            return Err(SessionError::Spawn(format!(
                "tcgetattr failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let mut termios = termios.assume_init();
        libc::cfmakeraw(&mut termios);
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(SessionError::Spawn(format!(
                "tcsetattr failed: {}",
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}
