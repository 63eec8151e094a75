//! Config loading and persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4600".to_string(),
            limits: Limits::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_bytes: usize,
    /// Live subscriptions one session may hold.
    pub max_subscriptions_per_session: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_bytes: 1024 * 1024,
            max_subscriptions_per_session: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: FileLoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

pub fn config_path() -> PathBuf {
    if let Some(dir) = std::env::var_os("RQ_CONFIG_DIR") {
        return PathBuf::from(dir).join("config.toml");
    }
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default();
    home.join(".config").join("ripple").join("config.toml")
}

pub fn load() -> Result<Config, ConfigError> {
    let path = config_path();
    let contents = fs::read_to_string(&path).map_err(|err| ConfigError::Read {
        path: path.clone(),
        reason: err.to_string(),
    })?;
    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path,
        reason: err.to_string(),
    })
}

pub fn load_or_init() -> Config {
    let path = config_path();
    if path.exists() {
        match load() {
            Ok(cfg) => return cfg,
            Err(err) => {
                tracing::warn!("config load failed, using defaults: {err}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(err) = write_config(&path, &cfg) {
        tracing::warn!("failed to write default config: {err}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|err| ConfigError::Write {
            path: dir.to_path_buf(),
            reason: err.to_string(),
        })?;
    }
    let contents = toml::to_string_pretty(cfg).map_err(|err| ConfigError::Write {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.to_path_buf(),
        reason,
    };
    let dir = path
        .parent()
        .ok_or_else(|| write_err("config path missing parent directory".to_string()))?;
    let temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|err| write_err(format!("temp file: {err}")))?;
    fs::write(temp.path(), data).map_err(|err| write_err(err.to_string()))?;
    temp.persist(path)
        .map_err(|err| write_err(err.to_string()))?;
    Ok(())
}
