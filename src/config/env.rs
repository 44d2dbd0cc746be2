//! Environment overrides for runtime configuration.
//!
//! Only a handful of knobs are exposed through `SHELLRELAY_*` variables; the
//! rest of the config lives in TOML.

use crate::error::ConfigError;

use super::defaults::MAX_BLOCKING_TIMEOUT_SECS;
use super::Config;

pub(super) fn apply_runtime_env_overrides<FEnv>(
    config: &mut Config,
    env_lookup: &FEnv,
) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(raw) = env_lookup("SHELLRELAY_BLOCKING_TIMEOUT_SECS") {
        config.executor.blocking_timeout_secs =
            parse_secs("SHELLRELAY_BLOCKING_TIMEOUT_SECS", &raw)?;
    }
    if let Some(raw) = env_lookup("SHELLRELAY_COMMAND_TIMEOUT_SECS") {
        // Clamp to at least 1 second to avoid "no-timeout" accidental behavior.
        config.executor.default_timeout_secs =
            parse_secs("SHELLRELAY_COMMAND_TIMEOUT_SECS", &raw)?.max(1);
    }
    if let Some(raw) = env_lookup("SHELLRELAY_LISTENER") {
        config.reverse_shell.listener = raw.parse().map_err(ConfigError::Invalid)?;
    }
    Ok(())
}

fn parse_secs(name: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "invalid {name} value `{raw}`: expected positive integer seconds"
        ))
    })
}

/// Reject values the executor and sessions cannot honor.
pub(super) fn validate(config: &Config) -> Result<(), ConfigError> {
    let blocking = config.executor.blocking_timeout_secs;
    if blocking == 0 || blocking > MAX_BLOCKING_TIMEOUT_SECS {
        return Err(ConfigError::Invalid(format!(
            "executor.blocking_timeout_secs must be within 1..={MAX_BLOCKING_TIMEOUT_SECS}, got {blocking}"
        )));
    }
    let transfer = &config.transfer;
    if transfer.single_command_max_bytes >= transfer.streaming_max_bytes {
        return Err(ConfigError::Invalid(format!(
            "transfer.single_command_max_bytes ({}) must be below transfer.streaming_max_bytes ({})",
            transfer.single_command_max_bytes, transfer.streaming_max_bytes
        )));
    }
    if transfer.chunk_chars == 0 || transfer.chunk_chars % 4 != 0 {
        return Err(ConfigError::Invalid(format!(
            "transfer.chunk_chars must be a positive multiple of 4, got {}",
            transfer.chunk_chars
        )));
    }
    if config.reverse_shell.listener == super::ListenerKind::Custom
        && config
            .reverse_shell
            .custom_program
            .as_deref()
            .map_or(true, |p| p.trim().is_empty())
    {
        return Err(ConfigError::Invalid(
            "reverse_shell.listener = \"custom\" requires reverse_shell.custom_program".into(),
        ));
    }
    Ok(())
}
