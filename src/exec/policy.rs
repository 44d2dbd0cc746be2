//! Tool policy lookup keyed by the command's leading executable.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::config::{ExecutorConfig, ToolsConfig};

/// What the executor may do with one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDecision {
    /// Basename of the leading token, e.g. `nmap` for `/usr/bin/nmap -sV`.
    pub tool: String,
    pub blocked: bool,
    pub streaming: bool,
    pub timeout: Duration,
}

/// Static tables loaded from `[tools]` config.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    blocked: BTreeSet<String>,
    streaming: BTreeSet<String>,
    timeouts: BTreeMap<String, u64>,
    default_timeout: Duration,
}

impl ToolPolicy {
    pub fn from_config(tools: &ToolsConfig, executor: &ExecutorConfig) -> Self {
        Self {
            blocked: tools.blocked.iter().map(|t| t.trim().to_string()).collect(),
            streaming: tools.streaming.iter().map(|t| t.trim().to_string()).collect(),
            timeouts: tools.timeouts.clone(),
            default_timeout: Duration::from_secs(executor.default_timeout_secs.max(1)),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Classify a full command string.
    pub fn decide(&self, command: &str) -> ToolDecision {
        let tool = leading_tool(command);
        ToolDecision {
            blocked: self.blocked.contains(&tool),
            streaming: self.streaming.contains(&tool),
            timeout: self
                .timeouts
                .get(&tool)
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or(self.default_timeout),
            tool,
        }
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::from_config(&ToolsConfig::default(), &ExecutorConfig::default())
    }
}

/// Basename of the first whitespace-separated token, skipping `sudo`/`env`
/// wrappers and `VAR=value` assignments.
pub fn leading_tool(command: &str) -> String {
    command
        .split_whitespace()
        .find(|token| !is_wrapper(token))
        .map(|token| {
            let token = token.trim_matches(|c| c == '\'' || c == '"');
            token.rsplit('/').next().unwrap_or(token).to_string()
        })
        .unwrap_or_default()
}

fn is_wrapper(token: &str) -> bool {
    matches!(token, "sudo" | "env" | "exec" | "nohup" | "time")
        || (token.contains('=') && !token.starts_with('-') && !token.contains('/'))
}
