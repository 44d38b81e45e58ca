use crate::error::Error;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum_macros::{Display, EnumString};

/// Execution tracer mode, see [`crate::tracer`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TraceMode {
    #[default]
    Normal,
    Record(PathBuf),
    Replay(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize, EnumString, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Settings that may come from a toml file, every field is optional there.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to gdb executable.
    pub gdb: PathBuf,
    /// Remote host for ssh helpers, empty for local debugging.
    pub host: Option<String>,
    /// Timeout for every write into gdb or editor descriptors.
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    /// Timeout for the blocking reads of editor responses.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    /// Timeout of a single coordinator poll iteration.
    #[serde(with = "millis")]
    pub poll_timeout: Duration,
    pub log_level: LogLevel,
    #[serde(skip)]
    pub trace: TraceMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gdb: PathBuf::from("/usr/bin/gdb"),
            host: None,
            write_timeout: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(1000),
            poll_timeout: Duration::from_millis(1000),
            log_level: LogLevel::Info,
            trace: TraceMode::Normal,
        }
    }
}

impl Config {
    /// Read configuration from a toml file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Default location of configuration file: `~/.config/pdp/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        home::home_dir().map(|home| home.join(".config").join("pdp").join("config.toml"))
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
