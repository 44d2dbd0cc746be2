//! Config loading: locate a source, parse TOML, apply env overrides, then
//! validate the result.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::env::{apply_runtime_env_overrides, validate};
use super::sources::locate;
use super::{config_root_dir, Config, ConfigDiagnostics, LoadedConfig};

/// Load configuration from the discovered file and the process environment.
///
/// `path_override` comes from `--config`.
pub fn load_config(path_override: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with_diagnostics(path_override).map(|loaded| loaded.config)
}

/// Like [`load_config`], also reporting which source was used.
pub fn load_config_with_diagnostics(
    path_override: Option<&str>,
) -> Result<LoadedConfig, ConfigError> {
    load_config_with_diagnostics_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
    )
}

/// Loader with every side effect injected, for tests.
pub(super) fn load_config_with_diagnostics_from_sources(
    path_override: Option<&str>,
    read_file: impl Fn(&Path) -> std::io::Result<String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    config_root: impl Fn() -> Option<PathBuf>,
) -> Result<LoadedConfig, ConfigError> {
    let (text, source) = locate(path_override, config_root(), read_file)?;
    tracing::debug!(%source, "resolved config source");

    let mut config: Config = toml::from_str(&text)?;
    apply_runtime_env_overrides(&mut config, &env_lookup)?;
    validate(&config)?;

    let diagnostics = ConfigDiagnostics {
        notes: vec![source.to_string()],
    };
    Ok(LoadedConfig {
        config,
        diagnostics,
    })
}
