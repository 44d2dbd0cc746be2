//! Compile-time build metadata exposed to CLI/runtime surfaces.

/// Semver package version from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// VCS commit hash captured at build time.
pub const GIT_COMMIT: &str = env!("SHELLRELAY_BUILD_GIT_HASH");

/// Build timestamp captured at compile time.
pub const BUILD_TIMESTAMP: &str = env!("SHELLRELAY_BUILD_TIMESTAMP");

/// Help trailer block that surfaces build metadata in `shellrelay --help`.
pub const HELP_BUILD_METADATA: &str = concat!(
    "Build metadata:\n  commit: ",
    env!("SHELLRELAY_BUILD_GIT_HASH"),
    "\n  built: ",
    env!("SHELLRELAY_BUILD_TIMESTAMP")
);

/// One-line build summary logged at startup.
pub fn startup_metadata_line() -> String {
    format!("v{VERSION} ({GIT_COMMIT}, built {BUILD_TIMESTAMP})")
}

/// Version block printed by `shellrelay --version`.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("SHELLRELAY_BUILD_GIT_HASH"),
    "\nbuilt: ",
    env!("SHELLRELAY_BUILD_TIMESTAMP")
);
