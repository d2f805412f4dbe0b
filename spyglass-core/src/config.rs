//! # Settings
//!
//! Runtime configuration, read from the process environment:
//!
//! * `SPYGLASS_DEBUG` - `1`, `true`, `yes` or `on` enables debug diagnostics.
//! * `SPYGLASS_DATA_DIR` - overrides the directory where workspaces, recents and history are stored.
//!   Defaults to the platform data directory.
use crate::codec::CodecOptions;
use crate::connection::KeepAliveConfig;
use crate::invoker::BufferLimits;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEBUG_ENV: &str = "SPYGLASS_DEBUG";
pub const DATA_DIR_ENV: &str = "SPYGLASS_DATA_DIR";

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {name}, expected one of 1/0, true/false, yes/no, on/off")]
    InvalidBool { name: &'static str, value: String },

    #[error("Could not determine a data directory, set {DATA_DIR_ENV}")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Base directory for all persisted state.
    pub data_dir: PathBuf,
    /// Verbose diagnostics.
    pub debug: bool,
    pub keep_alive: KeepAliveConfig,
    /// Dial deadline used when an endpoint does not carry its own.
    pub dial_timeout: Duration,
    pub buffer: BufferLimits,
    pub codec: CodecOptions,
}

impl Settings {
    /// Reads the settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let debug = match lookup(DEBUG_ENV) {
            Some(value) => parse_bool(DEBUG_ENV, &value)?,
            None => false,
        };

        let data_dir = match lookup(DATA_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir().ok_or(ConfigError::NoDataDir)?,
        };

        Ok(Self {
            debug,
            ..Self::with_data_dir(data_dir)
        })
    }

    /// Default settings storing everything under `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            debug: false,
            keep_alive: KeepAliveConfig::default(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            buffer: BufferLimits::default(),
            codec: CodecOptions::default(),
        }
    }
}

fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("dev", "spyglass", "spyglass").map(|dirs| dirs.data_dir().to_path_buf())
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn reads_data_dir_and_debug_flag() {
        let settings =
            Settings::from_lookup(lookup(&[(DATA_DIR_ENV, "/tmp/spy"), (DEBUG_ENV, "yes")]))
                .unwrap();

        assert_eq!(settings.data_dir, PathBuf::from("/tmp/spy"));
        assert!(settings.debug);
        assert_eq!(settings.buffer, BufferLimits::default());
        assert_eq!(settings.keep_alive.interval, Duration::from_secs(10));
    }

    #[test]
    fn rejects_unparseable_debug_flag() {
        let err = Settings::from_lookup(lookup(&[(DATA_DIR_ENV, "/tmp"), (DEBUG_ENV, "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { .. }));
    }
}
