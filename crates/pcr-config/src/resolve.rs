//! Config resolution: CLI → env → XDG → defaults.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::settings::EngineSettings;

const DIR_NAME: &str = "pcap_replay";
const CONFIG_FILE: &str = "config.toml";
const HISTORY_DB_FILE: &str = "history.sqlite3";

const ENV_CONFIG: &str = "PCR_CONFIG";
const ENV_DATA_DIR: &str = "PCR_DATA";
const ENV_REPLAY_BINARY: &str = "PCR_REPLAY_BINARY";
const ENV_HISTORY_DB: &str = "PCR_HISTORY_DB";

/// Errors from config resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to resolve data directory")]
    DataDirUnavailable,
}

impl From<ConfigError> for pcr_common::Error {
    fn from(err: ConfigError) -> Self {
        pcr_common::Error::Config(err.to_string())
    }
}

/// Where the resolved configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    /// Config file that was loaded, if any.
    pub config_file: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub history_db: PathBuf,
}

/// Resolve settings from the process environment.
pub fn resolve_config(
    explicit: Option<&Path>,
) -> Result<(EngineSettings, ConfigPaths), ConfigError> {
    resolve_config_with(explicit, |key| std::env::var(key).ok())
}

/// Resolve settings with an injectable environment lookup.
pub fn resolve_config_with(
    explicit: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<(EngineSettings, ConfigPaths), ConfigError> {
    let config_file = locate_config_file(explicit, &env)?;

    let mut settings = match &config_file {
        Some(path) => load_file(path)?,
        None => EngineSettings::default(),
    };

    if let Some(binary) = env(ENV_REPLAY_BINARY).filter(|v| !v.is_empty()) {
        settings.replay_binary = PathBuf::from(binary);
    }
    if let Some(db) = env(ENV_HISTORY_DB).filter(|v| !v.is_empty()) {
        settings.history.db_path = Some(PathBuf::from(db));
    }

    let data_dir = resolve_data_dir_with(&env)?;
    let history_db = settings
        .history
        .db_path
        .clone()
        .unwrap_or_else(|| data_dir.join(HISTORY_DB_FILE));
    settings.history.db_path = Some(history_db.clone());

    let validation = settings.validate();
    if !validation.is_valid() {
        let joined = validation
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ConfigError::Invalid(joined));
    }

    Ok((
        settings,
        ConfigPaths {
            config_file,
            data_dir,
            history_db,
        },
    ))
}

/// Load and parse a TOML settings file.
pub fn load_file(path: &Path) -> Result<EngineSettings, ConfigError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    EngineSettings::from_toml(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn locate_config_file(
    explicit: Option<&Path>,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Option<PathBuf>, ConfigError> {
    // 1) Explicit CLI path must exist
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        return Ok(Some(path.to_path_buf()));
    }

    // 2) Environment override must exist
    if let Some(path) = env(ENV_CONFIG).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        return Ok(Some(path));
    }

    // 3) XDG config dir is optional
    let base = env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(dirs::config_dir);
    Ok(base
        .map(|dir| dir.join(DIR_NAME).join(CONFIG_FILE))
        .filter(|path| path.exists()))
}

/// Resolve the data directory from the process environment.
pub fn resolve_data_dir() -> Result<PathBuf, ConfigError> {
    resolve_data_dir_with(&|key: &str| std::env::var(key).ok())
}

fn resolve_data_dir_with(env: &impl Fn(&str) -> Option<String>) -> Result<PathBuf, ConfigError> {
    // 1) Explicit override
    if let Some(dir) = env(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }

    // 2) XDG_DATA_HOME
    if let Some(xdg) = env("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(xdg).join(DIR_NAME));
    }

    // 3) Platform default
    if let Some(base) = dirs::data_dir() {
        return Ok(base.join(DIR_NAME));
    }

    Err(ConfigError::DataDirUnavailable)
}
