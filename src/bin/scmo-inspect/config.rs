use std::fs;
use std::path::{Path, PathBuf};

use scmo::StreamerOptions;
use serde::Deserialize;
use thiserror::Error;

/// Settings read from the inspector's TOML file.
#[derive(Debug, Default)]
pub struct InspectConfig {
    pub path: Option<PathBuf>,
    pub streamer: StreamerOptions,
    pub log_filter: Option<String>,
}

impl InspectConfig {
    /// Loads `explicit`, or the default location when it exists.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path),
            None => default_config_path().filter(|p| p.exists()),
        };
        let data = match path.as_ref() {
            Some(config_path) => read_file(config_path)?,
            None => RawConfig::default(),
        };
        Ok(Self {
            path,
            streamer: data.streamer,
            log_filter: data.log.filter,
        })
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    streamer: StreamerOptions,
    #[serde(default)]
    log: LogSection,
}

#[derive(Debug, Default, Deserialize)]
struct LogSection {
    filter: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read inspector config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse inspector config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("scmo").join("inspect.toml"))
}
