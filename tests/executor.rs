//! Executor behaviour through the public API: partial output on timeout
//! and blocking detection on streamed commands.

use shellrelay::config::Config;
use shellrelay::exec::{ExecOptions, ExecResponse, Executor, StreamEvent};
use std::time::{Duration, Instant};
use tokio::time::timeout;

async fn drain(mut rx: tokio::sync::mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_secs(20), rx.recv()).await {
        let done = event == StreamEvent::Complete;
        events.push(event);
        if done {
            break;
        }
    }
    events
}

#[tokio::test]
async fn timed_out_command_keeps_partial_output() {
    let executor = Executor::from_config(&Config::default());
    let started = Instant::now();
    let result = executor
        .execute(
            "echo line; sleep 10",
            ExecOptions {
                timeout: Some(Duration::from_secs(2)),
                ..ExecOptions::default()
            },
        )
        .await
        .expect("command runs");

    assert!(result.timed_out);
    assert!(result.partial_results);
    assert!(result.success, "output before the deadline counts as success");
    assert!(result.stdout.contains("line"));
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn blocked_tool_surfaces_in_response_shape() {
    let executor = Executor::from_config(&Config::default());
    let response =
        ExecResponse::from(executor.execute("telnet 10.0.0.1 23", ExecOptions::default()).await);
    assert!(!response.success);
    assert!(response.blocked);
    assert!(response.error.is_some());
}

#[tokio::test]
async fn silent_streamed_command_is_reported_as_blocking() {
    let executor = Executor::from_config(&Config::default())
        .with_blocking_timeout(Duration::from_secs(1))
        .with_heartbeat_interval(Duration::from_millis(200));
    let started = Instant::now();
    let rx = executor.stream_execution("sleep 30", Some(Duration::from_secs(60)), true);
    let events = drain(rx).await;

    assert_eq!(events.last(), Some(&StreamEvent::Complete));
    let blocking = events.iter().any(|event| {
        matches!(event, StreamEvent::Error { message } if message.contains("blocking"))
    });
    assert!(blocking, "events: {events:?}");
    assert!(started.elapsed() < Duration::from_secs(15));
}

#[tokio::test]
async fn streamed_lines_arrive_before_result() {
    let executor = Executor::from_config(&Config::default())
        .with_heartbeat_interval(Duration::from_millis(200));
    let rx = executor.stream_execution("bash -c 'echo one; sleep 0.3; echo two'", None, false);
    let events = drain(rx).await;

    let first_output = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Output { .. }));
    let result = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Result { .. }));
    assert!(first_output.is_some(), "events: {events:?}");
    assert!(first_output < result);
}
