//! Transport layer for the sniffer's serial endpoints
//!
//! Supports:
//! - USB CDC serial ports exposed by the sniffer board
//! - In-memory loopback pairs (tests and dry runs)

mod memory;
mod serial;

pub use memory::MemoryTransport;
pub use serial::{catsniffer_ports, list_ports, SerialConfig, SerialTransport, CATSNIFFER_PID, CATSNIFFER_VID};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failures opening or talking to a sniffer port
#[derive(Error, Debug)]
pub enum TransportError {
    /// The device refused to open
    #[error("Cannot open {0}")]
    ConnectionFailed(String),

    /// No such device node
    #[error("Serial port not found: {0}")]
    PortNotFound(String),

    /// The user lacks access to the device node
    #[error("Access to {0} denied")]
    PermissionDenied(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// `connect` has not been called
    #[error("Port not open")]
    NotConnected,

    /// The board was unplugged or the peer hung up
    #[error("Device disconnected")]
    Disconnected,
}

/// Byte counters kept by each transport since its last `connect`
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    /// Bytes written to the device
    pub bytes_sent: u64,
    /// Bytes read from the device
    pub bytes_received: u64,
    /// Write calls
    pub writes: u64,
    /// Chunks delivered by `receive`
    pub reads: u64,
}

/// Byte transport underneath an endpoint
#[async_trait]
pub trait TransportTrait: Send + Sync {
    /// Open the device and reset the counters
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Close the device; idempotent
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether `connect` succeeded and `disconnect` has not run since
    fn is_connected(&self) -> bool;

    /// Write all of `data` and flush
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Wait for the next inbound chunk.
    ///
    /// Cancel-safe: dropping the future never loses bytes, so callers may
    /// race it against timers in `tokio::select!`.
    async fn receive(&mut self) -> Result<Bytes, TransportError>;

    /// Human readable device description for logs
    fn connection_info(&self) -> String;

    /// Counters since the last `connect`
    fn stats(&self) -> TransportStats;
}
