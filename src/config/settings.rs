//! Configuration loading and defaults

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::util::config_path;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Limits and policies for one transport session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Deepest nesting of records a served call graph may carry
    pub max_graph_depth: usize,
    /// Largest frame accepted or produced by line transports
    pub max_frame_bytes: usize,
    /// Upper bound on a single `resolve()`; `None` waits indefinitely
    pub resolve_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_graph_depth: 32,
            max_frame_bytes: 1024 * 1024,
            resolve_timeout: None,
        }
    }
}

/// `[session]` table; every field is optional
#[derive(Debug, Default, Deserialize)]
pub struct TomlSessionConfig {
    pub max_graph_depth: Option<usize>,
    pub max_frame_bytes: Option<usize>,
    pub resolve_timeout_ms: Option<u64>,
}

/// Root of the TOML config file
#[derive(Debug, Default, Deserialize)]
pub struct TomlConfig {
    pub session: Option<TomlSessionConfig>,
}

impl SessionConfig {
    /// Load `~/.capwire/config.toml`, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load an explicit config file; a missing file is an error
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed: TomlConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::default();
        if let Some(session) = parsed.session {
            config.merge(session)?;
        }
        tracing::debug!(path = %path.display(), ?config, "Loaded config");
        Ok(config)
    }

    /// Overlay values present in `toml` on top of `self`
    pub fn merge(&mut self, toml: TomlSessionConfig) -> Result<(), ConfigError> {
        if let Some(depth) = toml.max_graph_depth {
            if depth == 0 {
                return Err(ConfigError::Invalid {
                    field: "max_graph_depth",
                    reason: "must be at least 1".to_string(),
                });
            }
            self.max_graph_depth = depth;
        }
        if let Some(bytes) = toml.max_frame_bytes {
            if bytes < 64 {
                return Err(ConfigError::Invalid {
                    field: "max_frame_bytes",
                    reason: format!("{bytes} is below the 64 byte minimum"),
                });
            }
            self.max_frame_bytes = bytes;
        }
        match toml.resolve_timeout_ms {
            Some(0) => self.resolve_timeout = None,
            Some(ms) => self.resolve_timeout = Some(Duration::from_millis(ms)),
            None => {}
        }
        Ok(())
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = Some(timeout);
        self
    }

    pub fn with_max_graph_depth(mut self, depth: usize) -> Self {
        self.max_graph_depth = depth;
        self
    }
}
