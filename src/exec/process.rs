//! Child-process lifecycle shared by the executor and session teardown.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};

use crate::error::ExecError;

use super::{OutputLine, OutputSink, OutputSource};

/// Upper bound on waiting for pipe readers after the child is gone.
const READER_JOIN_LIMIT: Duration = Duration::from_secs(2);

/// How a captured run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RunExit {
    Exited(i32),
    TimedOut,
    Cancelled,
}

/// Output captured from one child process.
#[derive(Debug, Clone)]
pub(super) struct CapturedRun {
    pub(super) stdout: String,
    pub(super) stderr: String,
    pub(super) exit: RunExit,
}

/// Plain output of a short helper process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawn `program` in its own process group and capture both pipes.
///
/// Each pipe gets a dedicated reader task so a chatty child can never stall
/// on a full pipe buffer. Timeout and cancellation terminate the whole group
/// (SIGTERM, then SIGKILL after `grace`).
pub(super) async fn run_captured(
    program: &str,
    args: &[String],
    limit: Duration,
    sink: Option<OutputSink>,
    cancel: Option<watch::Receiver<bool>>,
    grace: Duration,
) -> Result<CapturedRun, ExecError> {
    let mut cmd = Command::new(program);
    // Dropping the owning future (e.g. an aborted stream task) must not leak
    // the child.
    cmd.kill_on_drop(true);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::Spawn(format!("{program}: {e}")))?;
    let pid = child.id();

    let stdout_buf = Arc::new(Mutex::new(String::new()));
    let stderr_buf = Arc::new(Mutex::new(String::new()));
    let stdout_task = tokio::spawn(drain_pipe(
        child.stdout.take(),
        OutputSource::Stdout,
        Arc::clone(&stdout_buf),
        sink.clone(),
    ));
    let stderr_task = tokio::spawn(drain_pipe(
        child.stderr.take(),
        OutputSource::Stderr,
        Arc::clone(&stderr_buf),
        sink,
    ));

    let exit = tokio::select! {
        status = child.wait() => RunExit::Exited(status?.code().unwrap_or(-1)),
        _ = sleep(limit) => RunExit::TimedOut,
        _ = wait_cancelled(cancel) => RunExit::Cancelled,
    };
    if !matches!(exit, RunExit::Exited(_)) {
        terminate_child(&mut child, pid, grace).await;
    }

    let _ = timeout(READER_JOIN_LIMIT, stdout_task).await;
    let _ = timeout(READER_JOIN_LIMIT, stderr_task).await;

    Ok(CapturedRun {
        stdout: take_buffer(&stdout_buf),
        stderr: take_buffer(&stderr_buf),
        exit,
    })
}

async fn drain_pipe<R>(
    pipe: Option<R>,
    source: OutputSource,
    buffer: Arc<Mutex<String>>,
    sink: Option<OutputSink>,
) where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&raw);
                if let Ok(mut buf) = buffer.lock() {
                    buf.push_str(&text);
                }
                let line = text.trim_end_matches(['\r', '\n']);
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(sink) = &sink {
                    let _ = sink.send(OutputLine {
                        source,
                        line: line.to_string(),
                    });
                }
            }
        }
    }
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    buffer
        .lock()
        .map(|mut buf| std::mem::take(&mut *buf))
        .unwrap_or_default()
}

async fn wait_cancelled(cancel: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = cancel else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: never fire.
            return std::future::pending().await;
        }
    }
}

/// Graceful then forced termination of a child and its process group.
async fn terminate_child(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
    if timeout(grace, child.wait()).await.is_ok() {
        return;
    }
    tracing::debug!(?pid, "child ignored SIGTERM; killing");
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    let _ = child.kill().await;
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// process itself when it is not a group leader.
pub(crate) fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pid only
    // yields ESRCH.
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}

/// Spawn and wait for a short helper process.
pub async fn run_process(program: &str, args: &[String]) -> Result<ProcessOutput, ExecError> {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let output = cmd
        .output()
        .await
        .map_err(|e| ExecError::Spawn(format!("{program}: {e}")))?;
    Ok(ProcessOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Human-oriented duration formatting used in messages.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs == 0 {
        return format!("{millis}ms");
    }
    if millis == 0 {
        if secs % 3600 == 0 {
            return format!("{}h", secs / 3600);
        }
        if secs % 60 == 0 {
            return format!("{}m", secs / 60);
        }
        return format!("{secs}s");
    }
    format!("{secs}.{millis:03}s")
}

/// Shell-safe single-quote escaping.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".into()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
