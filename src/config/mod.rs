//! Session configuration.

mod settings;

pub use settings::{ConfigError, SessionConfig, TomlConfig, TomlSessionConfig};
