//! CLI Module
//!
//! Provides the extcap side of the binary:
//! - Exit codes reported to the analyzer
//! - Interface, DLT and argument listings

pub mod exit_codes;
pub mod extcap;

pub use exit_codes::{CliResult, ExitCodes};
pub use extcap::{Interface, PortOption};
