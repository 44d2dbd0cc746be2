//! Marker-framed command protocol over a shared interactive channel.
//!
//! The driver writes `echo '<start>'`, the command, and (after a settle delay)
//! `echo '<end>'`, then polls the channel until the end marker shows up or the
//! caller's timeout elapses. Parsing is delegated to [`super::transcript`].

use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::config::FrameConfig;
use crate::error::SessionError;

use super::transcript::{
    drop_echo_lines, filter_noise, FrameScanner, FrameTranscript, Markers, ScanMode,
};

/// Result of one bounded read from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// Nothing arrived within the wait window.
    Idle,
    /// The channel is gone (peer exit, stop, read error).
    Closed,
}

/// Byte-level access to one interactive channel.
///
/// Implementations must bound every read by `wait` so callers can re-poll
/// and observe deadlines without a thread per read.
#[async_trait]
pub trait ChannelIo: Send + Sync {
    async fn write_all(&self, data: &[u8]) -> Result<(), SessionError>;
    async fn read_chunk(&self, wait: Duration) -> ReadOutcome;
}

/// Output of one framed command.
#[derive(Debug, Clone)]
pub struct FrameOutput {
    /// Command output after echo and noise removal.
    pub lines: Vec<String>,
    pub transcript: FrameTranscript,
    pub markers: Markers,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl FrameOutput {
    pub fn output(&self) -> String {
        self.lines.join("\n")
    }
}

/// Discard bytes left over from earlier commands or banners.
pub async fn drain_residual<C: ChannelIo + ?Sized>(io: &C) -> Result<usize, SessionError> {
    let mut drained = 0usize;
    loop {
        match io.read_chunk(Duration::ZERO).await {
            ReadOutcome::Data(bytes) => drained += bytes.len(),
            ReadOutcome::Idle => return Ok(drained),
            ReadOutcome::Closed => {
                return Err(SessionError::ConnectionLost(
                    "channel closed before command was sent".into(),
                ))
            }
        }
    }
}

/// Run `command` inside a fresh marker frame.
///
/// Returns partial output with `timed_out = true` when the deadline passes
/// first; a closed channel is an error.
pub async fn run_frame<C: ChannelIo + ?Sized>(
    io: &C,
    timing: &FrameConfig,
    command: &str,
    timeout: Duration,
    mode: ScanMode,
) -> Result<FrameOutput, SessionError> {
    let started = Instant::now();
    let drained = drain_residual(io).await?;
    if drained > 0 {
        tracing::debug!(bytes = drained, "discarded residual channel output");
    }

    let markers = Markers::generate();
    let opening = format!(
        "{}\n{}\n",
        Markers::echo_line(&markers.start),
        command.trim_end_matches('\n')
    );
    io.write_all(opening.as_bytes()).await?;
    tokio::time::sleep(timing.settle()).await;
    io.write_all(format!("{}\n", Markers::echo_line(&markers.end)).as_bytes())
        .await?;

    let deadline = started + timeout;
    let mut scanner = FrameScanner::new(markers.clone(), mode);
    let mut timed_out = false;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            timed_out = true;
            break;
        }
        match io.read_chunk(remaining.min(timing.poll_interval())).await {
            ReadOutcome::Data(bytes) => {
                if scanner.feed(&bytes) {
                    break;
                }
            }
            ReadOutcome::Idle => {}
            ReadOutcome::Closed => {
                return Err(SessionError::ConnectionLost(format!(
                    "channel closed while waiting for output of `{}`",
                    first_line(command)
                )))
            }
        }
    }

    let transcript = scanner.finish();
    if timed_out {
        tracing::debug!(
            synchronized = transcript.synchronized,
            lines = transcript.lines.len(),
            "frame timed out before end marker"
        );
    }
    let lines = filter_noise(&drop_echo_lines(
        transcript.lines.clone(),
        command,
        &markers,
    ));
    Ok(FrameOutput {
        lines,
        transcript,
        markers,
        timed_out,
        elapsed: started.elapsed(),
    })
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or_default()
}
