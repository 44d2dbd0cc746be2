//! One-shot command executor.
//!
//! Runs an external command through `sh -c` with a hard timeout, optional
//! line streaming over an mpsc channel, and a tool policy that rejects
//! commands which belong on an interactive session instead. Streaming plus
//! blocking detection for long-lived response streams lives in [`stream`].

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::error::ExecError;

mod policy;
mod process;
pub mod stream;

pub use policy::{leading_tool, ToolDecision, ToolPolicy};
pub(crate) use process::signal_group;
pub use process::{format_duration, run_process, shell_quote, ProcessOutput};
pub use stream::StreamEvent;

use process::{run_captured, RunExit};

/// Sentinel return code for commands that never exited on their own.
pub const TIMEOUT_RETURN_CODE: i32 = -1;

/// Which pipe a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One non-empty line pushed to a streaming consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputLine {
    pub source: OutputSource,
    pub line: String,
}

/// Receiving half is drained by the caller.
pub type OutputSink = mpsc::UnboundedSender<OutputLine>;

/// Per-call knobs for [`Executor::execute`].
#[derive(Debug, Default)]
pub struct ExecOptions {
    /// Overrides the policy timeout for this call.
    pub timeout: Option<Duration>,
    pub sink: Option<OutputSink>,
    /// Flipping this to `true` terminates the command.
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Outcome of one executed command.
#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub tool: String,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub success: bool,
    pub timed_out: bool,
    /// Output was captured even though the command did not finish.
    pub partial_results: bool,
    pub cancelled: bool,
    pub streaming: bool,
    pub execution_time: f64,
}

/// Serializable result shape: always carries a `success` flag.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    pub timed_out: bool,
    pub partial_results: bool,
    pub blocked: bool,
    pub execution_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<ExecResult, ExecError>> for ExecResponse {
    fn from(result: Result<ExecResult, ExecError>) -> Self {
        match result {
            Ok(result) => Self {
                success: result.success,
                stdout: result.stdout,
                stderr: result.stderr,
                return_code: result.return_code,
                timed_out: result.timed_out,
                partial_results: result.partial_results,
                blocked: false,
                execution_time: result.execution_time,
                error: None,
            },
            Err(err) => Self {
                success: false,
                return_code: TIMEOUT_RETURN_CODE,
                blocked: matches!(err, ExecError::Blocked { .. }),
                error: Some(err.to_string()),
                ..Self::default()
            },
        }
    }
}

/// Command executor configured from `[executor]` and `[tools]`.
#[derive(Debug, Clone)]
pub struct Executor {
    policy: ToolPolicy,
    kill_grace: Duration,
    strict_timeouts: bool,
    blocking_timeout: Duration,
    heartbeat_interval: Duration,
}

impl Executor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            policy: ToolPolicy::from_config(&config.tools, &config.executor),
            kill_grace: config.executor.kill_grace(),
            strict_timeouts: config.executor.strict_timeouts,
            blocking_timeout: config.executor.blocking_timeout(),
            heartbeat_interval: config.executor.heartbeat_interval(),
        }
    }

    pub fn policy(&self) -> &ToolPolicy {
        &self.policy
    }

    pub fn blocking_timeout(&self) -> Duration {
        self.blocking_timeout
    }

    /// Override the blocking window (mainly for short-lived callers).
    pub fn with_blocking_timeout(mut self, window: Duration) -> Self {
        self.blocking_timeout = window;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Validate against policy, then run `command` under `sh -c`.
    pub async fn execute(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let decision = self.policy.decide(command);
        if decision.blocked {
            tracing::warn!(tool = %decision.tool, "rejected blocked tool");
            return Err(ExecError::Blocked {
                tool: decision.tool,
            });
        }
        self.run_shell(command, decision, options).await
    }

    /// Run `command` without the blocklist check.
    ///
    /// Reverse-shell triggers need this: their payloads are exactly the
    /// connection tools the blocklist keeps away from one-shot execution.
    pub async fn execute_trusted(
        &self,
        command: &str,
        options: ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let decision = self.policy.decide(command);
        self.run_shell(command, decision, options).await
    }

    async fn run_shell(
        &self,
        command: &str,
        decision: ToolDecision,
        options: ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let limit = options.timeout.unwrap_or(decision.timeout);
        tracing::debug!(tool = %decision.tool, timeout = %format_duration(limit), "executing command");
        let started = Instant::now();
        let run = run_captured(
            "sh",
            &["-c".to_string(), command.to_string()],
            limit,
            options.sink,
            options.cancel,
            self.kill_grace,
        )
        .await?;

        let has_output = !run.stdout.trim().is_empty() || !run.stderr.trim().is_empty();
        let (return_code, timed_out, cancelled) = match run.exit {
            RunExit::Exited(code) => (code, false, false),
            RunExit::TimedOut => (TIMEOUT_RETURN_CODE, true, false),
            RunExit::Cancelled => (TIMEOUT_RETURN_CODE, false, true),
        };
        if timed_out {
            tracing::info!(
                tool = %decision.tool,
                timeout = %format_duration(limit),
                has_output,
                "command timed out"
            );
        }
        let success = if timed_out {
            has_output && !self.strict_timeouts
        } else {
            !cancelled && return_code == 0
        };

        Ok(ExecResult {
            tool: decision.tool,
            stdout: run.stdout,
            stderr: run.stderr,
            return_code,
            success,
            timed_out,
            partial_results: (timed_out || cancelled) && has_output,
            cancelled,
            streaming: decision.streaming,
            execution_time: started.elapsed().as_secs_f64(),
        })
    }

    /// Run `program` with `args`, each shell-quoted.
    pub async fn execute_argv(
        &self,
        program: &str,
        args: &[&str],
        options: ExecOptions,
    ) -> Result<ExecResult, ExecError> {
        let mut command = shell_quote(program);
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        self.execute(&command, options).await
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
