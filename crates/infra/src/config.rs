//! Configuration loading and representation.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_DIR: &str = "EVENTSTORE_DIR";
pub const ENV_PACK_MIN_FILES: &str = "EVENTSTORE_PACK_MIN_FILES";
pub const ENV_XZ_LEVEL: &str = "EVENTSTORE_XZ_LEVEL";
pub const ENV_STREAM_LOCKING: &str = "EVENTSTORE_STREAM_LOCKING";

pub const DEFAULT_PACK_MINIMUM_FILES: usize = 100;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How writers exclude each other per stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamLocking {
    /// `LOCK.<category>.<id>` files; works across processes.
    #[default]
    MarkerFile,
    /// An in-memory set; only for a single process per directory.
    InProcess,
}

impl FromStr for StreamLocking {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "marker-file" => Ok(Self::MarkerFile),
            "in-process" => Ok(Self::InProcess),
            other => Err(format!("expected marker-file or in-process, got {other:?}")),
        }
    }
}

/// Settings for a flat-pack event store directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatPackConfig {
    pub base_directory: PathBuf,
    /// Compaction is skipped while fewer loose files than this exist.
    #[serde(default = "default_pack_minimum_files")]
    pub pack_minimum_files: usize,
    /// xz preset, 0 to 9.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,
    #[serde(default)]
    pub stream_locking: StreamLocking,
}

fn default_pack_minimum_files() -> usize {
    DEFAULT_PACK_MINIMUM_FILES
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

impl FlatPackConfig {
    pub fn new(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
            pack_minimum_files: DEFAULT_PACK_MINIMUM_FILES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            stream_locking: StreamLocking::default(),
        }
    }

    pub fn with_pack_minimum_files(mut self, pack_minimum_files: usize) -> Self {
        self.pack_minimum_files = pack_minimum_files;
        self
    }

    pub fn with_stream_locking(mut self, stream_locking: StreamLocking) -> Self {
        self.stream_locking = stream_locking;
        self
    }

    /// Read `EVENTSTORE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; unset optional values take
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_directory = lookup(ENV_DIR)
            .filter(|dir| !dir.is_empty())
            .ok_or(ConfigError::Missing(ENV_DIR))?;
        let mut config = Self::new(base_directory);

        if let Some(value) = lookup(ENV_PACK_MIN_FILES) {
            config.pack_minimum_files = parse(ENV_PACK_MIN_FILES, &value)?;
        }
        if let Some(value) = lookup(ENV_XZ_LEVEL) {
            let level: u32 = parse(ENV_XZ_LEVEL, &value)?;
            if level > 9 {
                return Err(ConfigError::Invalid {
                    name: ENV_XZ_LEVEL,
                    value,
                    reason: "xz presets range from 0 to 9".to_string(),
                });
            }
            config.compression_level = level;
        }
        if let Some(value) = lookup(ENV_STREAM_LOCKING) {
            config.stream_locking = parse(ENV_STREAM_LOCKING, &value)?;
        }
        Ok(config)
    }
}

fn parse<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}
