//! Where config text comes from.
//!
//! Candidates are tried in order: `--config`, `./shellrelay.toml`, then
//! `<config root>/shellrelay/shellrelay.toml`. When none can be read the
//! loader parses an empty document, so every section takes its defaults.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

/// File name searched for in the working directory and global config root.
pub(super) const CONFIG_FILE_NAME: &str = "shellrelay.toml";
const APP_DIR: &str = "shellrelay";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ConfigSource {
    Explicit(PathBuf),
    WorkingDir,
    UserConfig(PathBuf),
    Defaults,
}

impl ConfigSource {
    fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(path) | Self::UserConfig(path) => Some(path),
            Self::WorkingDir => Some(Path::new(CONFIG_FILE_NAME)),
            Self::Defaults => None,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Defaults => write!(f, "no config file found; using built-in defaults"),
            Self::WorkingDir => write!(f, "config loaded from `./{CONFIG_FILE_NAME}`"),
            Self::Explicit(path) | Self::UserConfig(path) => {
                write!(f, "config loaded from `{}`", path.display())
            }
        }
    }
}

/// Read the first available candidate.
///
/// An explicit path is the only candidate when given, and failing to read it
/// is an error rather than a silent fallback.
pub(super) fn locate(
    path_override: Option<&str>,
    user_config_root: Option<PathBuf>,
    read_file: impl Fn(&Path) -> io::Result<String>,
) -> io::Result<(String, ConfigSource)> {
    if let Some(path) = path_override {
        let source = ConfigSource::Explicit(PathBuf::from(path));
        let text = read_file(Path::new(path))?;
        return Ok((text, source));
    }

    let mut candidates = vec![ConfigSource::WorkingDir];
    if let Some(root) = user_config_root {
        candidates.push(ConfigSource::UserConfig(
            root.join(APP_DIR).join(CONFIG_FILE_NAME),
        ));
    }
    for source in candidates {
        let Some(path) = source.path() else { continue };
        if let Ok(text) = read_file(path) {
            return Ok((text, source));
        }
    }
    Ok((String::new(), ConfigSource::Defaults))
}
