//! Process exit codes
//!
//! The analyzer shows a non-zero exit status next to the capture, so every
//! failure class of the bridge maps to its own code.

use crate::config::ConfigError;
use crate::core::session::SessionError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Capture ended on request
    pub const SUCCESS: u8 = 0;

    /// Anything without a more specific code
    pub const ERROR: u8 = 1;

    /// Missing or contradictory command line flags
    pub const INVALID_ARGS: u8 = 2;

    /// A serial port failed to open or dropped mid-capture
    pub const CONNECTION_FAILED: u8 = 3;

    /// The board stopped answering commands
    pub const TIMEOUT: u8 = 4;

    /// A device node or pipe could not be opened for lack of rights
    pub const PERMISSION_DENIED: u8 = 7;

    /// Unreadable config file or out of range radio setting
    pub const CONFIG_ERROR: u8 = 8;

    /// Malformed toolbar message
    pub const PROTOCOL_ERROR: u8 = 9;

    /// The named serial port does not exist
    pub const PORT_NOT_FOUND: u8 = 14;

    /// The capture FIFO failed or its reader went away
    pub const PIPE_ERROR: u8 = 18;

    /// Short text for `code`, printed next to the error message
    pub fn describe(code: u8) -> &'static str {
        match code {
            Self::SUCCESS => "Success",
            Self::ERROR => "General error",
            Self::INVALID_ARGS => "Invalid arguments",
            Self::CONNECTION_FAILED => "Device connection failed",
            Self::TIMEOUT => "Device did not answer",
            Self::PERMISSION_DENIED => "Permission denied",
            Self::CONFIG_ERROR => "Configuration error",
            Self::PROTOCOL_ERROR => "Control channel protocol error",
            Self::PORT_NOT_FOUND => "Serial port not found",
            Self::PIPE_ERROR => "Capture pipe error",
            _ => "Unknown error",
        }
    }
}

/// Outcome of one extcap operation
#[derive(Debug)]
pub enum CliResult {
    /// Finished; the message, if any, goes to stderr
    Success(Option<String>),

    /// Failed with an exit code and a message for stderr
    Error(u8, String),
}

impl CliResult {
    /// Finished with nothing to report
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Finished with a summary line
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failed with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Bad command line
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::Error(ExitCodes::INVALID_ARGS, msg.into())
    }

    /// Numeric exit status
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Text for stderr
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Status handed back from `main`
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Whether the operation finished without error
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<SessionError> for CliResult {
    fn from(err: SessionError) -> Self {
        Self::Error(err.exit_code(), err.to_string())
    }
}

impl From<ConfigError> for CliResult {
    fn from(err: ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<std::io::Error> for CliResult {
    // Only the control pipes and the FIFO reach here as raw I/O errors.
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::PIPE_ERROR,
        };

        Self::Error(code, err.to_string())
    }
}
