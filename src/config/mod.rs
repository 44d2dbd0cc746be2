//! Configuration loading from TOML files and environment variables.
//!
//! Config is loaded in this order of precedence (highest wins):
//! 1. Environment variables (`SHELLRELAY_BLOCKING_TIMEOUT_SECS`,
//!    `SHELLRELAY_COMMAND_TIMEOUT_SECS`, `SHELLRELAY_LISTENER`)
//! 2. TOML file specified via --config CLI flag
//! 3. ./shellrelay.toml in the current directory
//! 4. $XDG_CONFIG_HOME/shellrelay/shellrelay.toml (or
//!    ~/.config/shellrelay/shellrelay.toml)
//! 5. Built-in defaults

use std::path::PathBuf;

mod defaults;
mod env;
mod loader;
mod sources;
mod types;

pub use loader::{load_config, load_config_with_diagnostics};
pub use types::{
    Config, ConfigDiagnostics, ExecutorConfig, FrameConfig, ListenerKind, LoadedConfig,
    ReverseShellConfig, SshConfig, ToolsConfig, TransferConfig,
};

/// Root directory for global config files.
pub fn config_root_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
