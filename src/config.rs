//! Persisted plugin settings.
//!
//! Settings live in a small JSON file, `unpacme_search.cfg`, under the user
//! configuration directory. The API key is never stored here; see
//! [`crate::credentials`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::logging::{log_warn, Logger};

/// File name of the settings file
pub const CONFIG_FILE_NAME: &str = "unpacme_search.cfg";

/// Directory below the user config dir holding the settings file
pub const APP_DIR_NAME: &str = "unpacme_search";

/// Level names offered by the settings dialog
pub const LOG_LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARNING", "ERROR"];

/// Errors raised while reading or writing settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No home directory could be determined
    #[error("could not determine the user configuration directory")]
    NoConfigDir,

    /// The file exists but could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid settings JSON
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The file or its directory could not be written
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Settings could not be serialized
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Plugin settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Log level name, e.g. `INFO`
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Show the preview/edit dialog before searching
    #[serde(default = "enabled")]
    pub preview: bool,
    /// Wildcard position-dependent operands
    #[serde(default = "enabled")]
    pub auto: bool,
    /// Also search the goodware repository
    #[serde(default = "enabled")]
    pub goodware: bool,
}

fn default_loglevel() -> String {
    "INFO".to_string()
}

fn enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            preview: true,
            auto: true,
            goodware: true,
        }
    }
}

/// Settings as loaded, plus whether they came from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedConfig {
    pub config: Config,
    /// True when no settings file existed and defaults were used
    pub first_run: bool,
}

impl Config {
    /// `<config dir>/unpacme_search/unpacme_search.cfg`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = BaseDirs::new().ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load settings from `path`.
    ///
    /// A missing file is not an error: defaults are returned with
    /// `first_run` set.
    pub fn load_from(path: &Path) -> Result<LoadedConfig, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(LoadedConfig {
                    config: Config::default(),
                    first_run: true,
                });
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let config = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(LoadedConfig {
            config,
            first_run: false,
        })
    }

    /// Write settings to `path`, creating its directory if needed
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let contents = serde_json::to_string(self)?;
        fs::write(path, contents).map_err(write_err)
    }

    /// Parsed `loglevel`, if it names a known level
    pub fn level_filter(&self) -> Option<LevelFilter> {
        parse_level(&self.loglevel)
    }

    /// Set `log` to the configured level, falling back to INFO.
    pub fn apply_level(&self, log: &Logger) {
        match self.level_filter() {
            Some(level) => log.set_level(level),
            None => {
                log.set_level(LevelFilter::Info);
                log_warn!(log, "Unknown log level '{}', using INFO", self.loglevel);
            }
        }
    }
}

/// Parse a level name case-insensitively
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_uppercase().as_str() {
        "DEBUG" => Some(LevelFilter::Debug),
        "INFO" => Some(LevelFilter::Info),
        "WARNING" | "WARN" => Some(LevelFilter::Warn),
        "ERROR" | "CRITICAL" => Some(LevelFilter::Error),
        _ => None,
    }
}
