//! # Catbridge Core Library
//!
//! Bridge between CatSniffer radio sniffers and a live packet analyzer:
//! - Frame extraction for the framed binary firmware (`@S` ... `@E`)
//! - Packet dissection for framed (802.15.4 / BLE) and LoRa firmware
//! - Capture file encoding with the CatSniffer link types (147, 148)
//! - Capture pipe sinks (FIFO on Unix, named pipe on Windows)
//! - Command/response correlation over serial endpoints
//! - Extcap toolbar control channel
//!
//! ## Example
//!
//! ```rust,no_run
//! use catbridge_core::core::context::CaptureContext;
//! use catbridge_core::core::protocol::DeviceFamily;
//! use catbridge_core::core::session::{CaptureSession, DeviceLink, SessionConfig};
//! use catbridge_core::core::sink::platform_sink;
//! use catbridge_core::core::transport::{SerialConfig, SerialTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let link = DeviceLink::Framed {
//!         bridge: Box::new(SerialTransport::new(SerialConfig::new("/dev/ttyACM0", 921_600))),
//!     };
//!     let config = SessionConfig::new(CaptureContext::new(DeviceFamily::Framed));
//!     let stats = CaptureSession::new(config, link, platform_sink("/tmp/fcatsniffer"))
//!         .run(CancellationToken::new())
//!         .await?;
//!     println!("{} packets", stats.packets);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes};
pub use crate::config::BridgeConfig;
pub use crate::core::context::CaptureContext;
pub use crate::core::packet::{Category, Packet};
pub use crate::core::protocol::{DeviceFamily, Dissector, FrameExtractor};
pub use crate::core::session::{CaptureSession, DeviceLink, SessionConfig, SessionError, SessionStats};
pub use crate::core::transport::{SerialConfig, SerialTransport, TransportError, TransportTrait};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
