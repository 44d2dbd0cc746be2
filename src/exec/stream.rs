//! Live output streaming with blocking-command detection.
//!
//! The stream is consumed by a long-lived response (e.g. server-sent events)
//! that must not hang on a tool waiting for terminal input. A watchdog ticks
//! at the heartbeat cadence; if no output at all has arrived within the
//! blocking window, the command is cancelled and an error event is emitted.

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::{format_duration, ExecOptions, Executor, OutputSource};

/// Buffered events between the executor task and the consumer.
const EVENT_BUFFER: usize = 256;
/// Extra time granted to a cancelled command to release its pipes.
const CANCEL_SETTLE: Duration = Duration::from_secs(2);

/// One event on an execution stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Output { source: OutputSource, line: String },
    /// Keep-alive while waiting; carries no data.
    Heartbeat,
    Result {
        success: bool,
        return_code: i32,
        timed_out: bool,
    },
    Error { message: String },
    /// Always the final event.
    Complete,
}

impl Executor {
    /// Start `command` in the background and return its event stream.
    ///
    /// With `live` set, or for tools flagged as streaming, each line is
    /// forwarded as it arrives and the command is watched for blocking.
    /// Otherwise the captured output is emitted once the command finishes.
    pub fn stream_execution(
        &self,
        command: &str,
        limit: Option<Duration>,
        live: bool,
    ) -> mpsc::Receiver<StreamEvent> {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let executor = self.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            executor.drive_stream(command, limit, live, &events).await;
            let _ = events.send(StreamEvent::Complete).await;
        });
        rx
    }

    async fn drive_stream(
        &self,
        command: String,
        limit: Option<Duration>,
        live: bool,
        events: &mpsc::Sender<StreamEvent>,
    ) {
        let decision = self.policy.decide(&command);
        if !(live || decision.streaming) {
            let options = ExecOptions {
                timeout: limit,
                ..ExecOptions::default()
            };
            match self.execute(&command, options).await {
                Ok(result) => {
                    for (source, text) in [
                        (OutputSource::Stdout, &result.stdout),
                        (OutputSource::Stderr, &result.stderr),
                    ] {
                        for line in text.lines().filter(|l| !l.trim().is_empty()) {
                            let event = StreamEvent::Output {
                                source,
                                line: line.to_string(),
                            };
                            if events.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    let _ = events
                        .send(StreamEvent::Result {
                            success: result.success,
                            return_code: result.return_code,
                            timed_out: result.timed_out,
                        })
                        .await;
                }
                Err(err) => {
                    let _ = events
                        .send(StreamEvent::Error {
                            message: err.to_string(),
                        })
                        .await;
                }
            }
            return;
        }

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let executor = self.clone();
        let mut run = tokio::spawn(async move {
            executor
                .execute(
                    &command,
                    ExecOptions {
                        timeout: limit,
                        sink: Some(line_tx),
                        cancel: Some(cancel_rx),
                    },
                )
                .await
        });

        let started = Instant::now();
        let mut saw_output = false;
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(line) => {
                        saw_output = true;
                        let event = StreamEvent::Output { source: line.source, line: line.line };
                        if events.send(event).await.is_err() {
                            // Consumer went away; do not leave the tool running.
                            let _ = cancel_tx.send(true);
                            return;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if !saw_output && started.elapsed() >= self.blocking_timeout {
                        tracing::warn!(
                            window = %format_duration(self.blocking_timeout),
                            "no output from streamed command; treating as blocking"
                        );
                        let _ = cancel_tx.send(true);
                        let _ = events
                            .send(StreamEvent::Error {
                                message: format!(
                                    "Command appears to be blocking (no output within {}); it was terminated. Interactive tools must run through a session.",
                                    format_duration(self.blocking_timeout)
                                ),
                            })
                            .await;
                        let _ = timeout(self.kill_grace + CANCEL_SETTLE, &mut run).await;
                        return;
                    }
                    if events.send(StreamEvent::Heartbeat).await.is_err() {
                        let _ = cancel_tx.send(true);
                        return;
                    }
                }
            }
        }

        let event = match run.await {
            Ok(Ok(result)) => StreamEvent::Result {
                success: result.success,
                return_code: result.return_code,
                timed_out: result.timed_out,
            },
            Ok(Err(err)) => StreamEvent::Error {
                message: err.to_string(),
            },
            Err(err) => StreamEvent::Error {
                message: format!("execution task failed: {err}"),
            },
        };
        let _ = events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>, limit: Duration) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        let deadline = Instant::now() + limit;
        while let Ok(Some(event)) =
            timeout(deadline.saturating_duration_since(Instant::now()), rx.recv()).await
        {
            let done = event == StreamEvent::Complete;
            out.push(event);
            if done {
                break;
            }
        }
        out
    }

    fn fast_executor() -> Executor {
        Executor::default()
            .with_blocking_timeout(Duration::from_secs(1))
            .with_heartbeat_interval(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn streaming_tool_forwards_lines_in_order() {
        let rx = fast_executor().stream_execution(
            "bash -c 'echo a; echo b; echo c >&2'",
            None,
            false,
        );
        let events = collect(rx, Duration::from_secs(10)).await;
        let stdout: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Output {
                    source: OutputSource::Stdout,
                    line,
                } => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(stdout, vec!["a", "b"]);
        assert!(events.contains(&StreamEvent::Result {
            success: true,
            return_code: 0,
            timed_out: false
        }));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[tokio::test]
    async fn silent_streaming_tool_is_blocking_within_window() {
        let started = Instant::now();
        let rx = fast_executor().stream_execution(
            "bash -c 'sleep 30'",
            Some(Duration::from_secs(60)),
            false,
        );
        let events = collect(rx, Duration::from_secs(10)).await;
        let elapsed = started.elapsed();
        assert!(
            events.iter().any(|e| matches!(e, StreamEvent::Error { message } if message.contains("blocking"))),
            "got: {events:?}"
        );
        assert!(elapsed < Duration::from_secs(8), "took {elapsed:?}");
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[tokio::test]
    async fn live_request_watches_unflagged_tools() {
        let started = Instant::now();
        let rx = fast_executor().stream_execution("sleep 30", Some(Duration::from_secs(60)), true);
        let events = collect(rx, Duration::from_secs(10)).await;
        assert!(events.contains(&StreamEvent::Heartbeat), "got: {events:?}");
        assert!(
            events.iter().any(|e| matches!(e, StreamEvent::Error { message } if message.contains("blocking"))),
            "got: {events:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(8));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[tokio::test]
    async fn live_request_forwards_lines_of_unflagged_tools() {
        let rx = fast_executor().stream_execution("echo live; sleep 0.3; echo after", None, true);
        let events = collect(rx, Duration::from_secs(10)).await;
        let lines: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Output { line, .. } => Some(line.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(lines, vec!["live", "after"]);
        assert!(events.iter().any(|e| matches!(e, StreamEvent::Result { success: true, .. })));
    }

    #[tokio::test]
    async fn heartbeats_flow_while_waiting() {
        let rx = fast_executor().stream_execution("bash -c 'sleep 0.5; echo done'", None, false);
        let events = collect(rx, Duration::from_secs(10)).await;
        assert!(events.contains(&StreamEvent::Heartbeat), "got: {events:?}");
        assert!(events.iter().any(
            |e| matches!(e, StreamEvent::Output { line, .. } if line == "done")
        ));
    }

    #[tokio::test]
    async fn non_streaming_tool_reports_once() {
        let rx = fast_executor().stream_execution("echo single", None, false);
        let events = collect(rx, Duration::from_secs(10)).await;
        assert_eq!(
            events,
            vec![
                StreamEvent::Output {
                    source: OutputSource::Stdout,
                    line: "single".into()
                },
                StreamEvent::Result {
                    success: true,
                    return_code: 0,
                    timed_out: false
                },
                StreamEvent::Complete,
            ]
        );
    }

    #[tokio::test]
    async fn blocked_tool_streams_an_error() {
        let rx = fast_executor().stream_execution("telnet 10.0.0.1", None, false);
        let events = collect(rx, Duration::from_secs(5)).await;
        assert!(matches!(&events[0], StreamEvent::Error { message } if message.contains("telnet")));
        assert_eq!(events.last(), Some(&StreamEvent::Complete));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(StreamEvent::Output {
            source: OutputSource::Stderr,
            line: "x".into(),
        })
        .expect("json");
        assert_eq!(json["type"], "output");
        assert_eq!(json["source"], "stderr");
        let json = serde_json::to_value(StreamEvent::Heartbeat).expect("json");
        assert_eq!(json["type"], "heartbeat");
    }
}
