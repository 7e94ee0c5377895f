//! Bridge settings

use crate::core::context::{CaptureContext, FramedSettings, LoraSettings};
use crate::core::protocol::DeviceFamily;
use crate::core::session::SessionConfig;
use crate::core::sink::DEFAULT_PIPE_PATH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("could not determine config directory")]
    NoConfigDir,

    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        /// File path
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// File path
        path: PathBuf,
        /// Cause
        source: toml::de::Error,
    },

    /// Settings could not be serialized
    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// File could not be written
    #[error("failed to write settings: {0}")]
    Write(#[from] std::io::Error),
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate of the LoRa shell and data ports
    pub lora_baud: u32,
    /// Baud rate of the framed bridge port
    pub framed_baud: u32,
    /// Port read timeout in milliseconds
    pub read_timeout_ms: u64,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            lora_baud: 115_200,
            framed_baud: 921_600,
            read_timeout_ms: 100,
        }
    }
}

/// Device command timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Per-attempt response timeout in milliseconds
    pub timeout_ms: u64,
    /// Retransmissions after the first attempt
    pub retries: u32,
    /// Bound on the stop request at teardown, milliseconds
    pub stop_timeout_ms: u64,
    /// Gap after each framed device command, milliseconds
    pub pacing_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            retries: 1,
            stop_timeout_ms: 1000,
            pacing_ms: 100,
        }
    }
}

/// Capture output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Pipe path used when `--fifo` is not given
    pub fifo: String,
    /// Capture loop wake-up interval in milliseconds
    pub read_timeout_ms: u64,
    /// Telemetry units buffered ahead of the capture loop
    pub queue_depth: usize,
    /// Default log level
    pub log_level: String,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            fifo: DEFAULT_PIPE_PATH.to_string(),
            read_timeout_ms: 100,
            queue_depth: 1024,
            log_level: "info".to_string(),
        }
    }
}

/// Bridge configuration file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Serial ports
    pub serial: SerialSettings,
    /// Device commands
    pub commands: CommandSettings,
    /// Capture output
    pub capture: CaptureSettings,
    /// LoRa radio defaults
    pub lora: LoraSettings,
    /// Framed radio defaults
    pub framed: FramedSettings,
}

impl BridgeConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        super::config_dir()
            .map(|dir| dir.join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Load from the default location; defaults when the file does not exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load from `path`; defaults when the file does not exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Session settings for a capture on `family`
    pub fn session(&self, family: DeviceFamily) -> SessionConfig {
        let mut config = SessionConfig::new(CaptureContext {
            family,
            framed: self.framed,
            lora: self.lora,
        });
        config.command_timeout = Duration::from_millis(self.commands.timeout_ms);
        config.command_retries = self.commands.retries;
        config.stop_timeout = Duration::from_millis(self.commands.stop_timeout_ms);
        config.command_pacing = Duration::from_millis(self.commands.pacing_ms);
        config.read_timeout = Duration::from_millis(self.capture.read_timeout_ms);
        config.queue_depth = self.capture.queue_depth.max(1);
        config
    }
}
