//! Configuration module
//!
//! Bridge defaults loaded from a TOML file; command line flags override them

mod settings;

pub use settings::{BridgeConfig, CaptureSettings, CommandSettings, ConfigError, SerialSettings};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "catbridge", "Catbridge").map(|dirs| dirs.config_dir().to_path_buf())
}
