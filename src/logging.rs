//! Tracing subscriber setup for the binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "SHELLRELAY_LOG";

/// Resolve the filter directive from the environment lookup.
pub fn filter_directive(verbose: bool, env_lookup: impl Fn(&str) -> Option<String>) -> String {
    if verbose {
        return "shellrelay=debug,info".to_string();
    }
    env_lookup(LOG_ENV)
        .or_else(|| env_lookup("RUST_LOG"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

/// Install the global subscriber. Logs go to stderr so stdout stays JSON.
/// Calling it twice is harmless.
pub fn init(verbose: bool) {
    let directive = filter_directive(verbose, |key| std::env::var(key).ok());
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}
