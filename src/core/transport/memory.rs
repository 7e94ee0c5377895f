//! In-memory loopback transport
//!
//! `MemoryTransport::pair()` returns two connected ends; bytes sent on one
//! are received on the other. Used to stand in for the sniffer board.

use super::{TransportError, TransportStats, TransportTrait};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// One end of an in-memory byte pipe
pub struct MemoryTransport {
    name: String,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    connected: bool,
    stats: TransportStats,
}

impl MemoryTransport {
    /// Create a connected pair of transports
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::end("host", a_tx, a_rx), Self::end("device", b_tx, b_rx))
    }

    fn end(name: &str, tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            tx: Some(tx),
            rx,
            connected: false,
            stats: TransportStats::default(),
        }
    }

    /// Drop the sending half so the peer observes a disconnect
    pub fn hang_up(&mut self) {
        self.tx = None;
    }
}

#[async_trait]
impl TransportTrait for MemoryTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        self.connected = true;
        self.stats = TransportStats::default();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        tx.send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::Disconnected)?;
        self.stats.bytes_sent += data.len() as u64;
        self.stats.writes += 1;
        Ok(data.len())
    }

    async fn receive(&mut self) -> Result<Bytes, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let bytes = self.rx.recv().await.ok_or(TransportError::Disconnected)?;
        self.stats.bytes_received += bytes.len() as u64;
        self.stats.reads += 1;
        Ok(bytes)
    }

    fn connection_info(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }
}
