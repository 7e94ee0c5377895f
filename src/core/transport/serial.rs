//! Serial port transport implementation

use super::{TransportError, TransportStats, TransportTrait};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// USB vendor id of the CatSniffer board
pub const CATSNIFFER_VID: u16 = 0x1209;
/// USB product id of the CatSniffer board
pub const CATSNIFFER_PID: u16 = 0xBABB;

const READ_CHUNK: usize = 4096;
const RX_QUEUE_DEPTH: usize = 256;

/// Serial port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyACM0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Blocking read timeout of the reader thread
    pub read_timeout_ms: u64,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            read_timeout_ms: 100,
        }
    }

    /// Set the reader thread's read timeout
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyACM0", 115_200)
    }
}

struct Reader {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Serial port transport
///
/// A dedicated reader thread owns a cloned port handle and feeds an mpsc
/// queue, which keeps [`TransportTrait::receive`] cancel-safe.
pub struct SerialTransport {
    config: SerialConfig,
    port: Arc<parking_lot::Mutex<Option<Box<dyn SerialPort>>>>,
    stats: Arc<RwLock<TransportStats>>,
    rx: Option<mpsc::Receiver<std::io::Result<Bytes>>>,
    reader: Option<Reader>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: Arc::new(parking_lot::Mutex::new(None)),
            stats: Arc::new(RwLock::new(TransportStats::default())),
            rx: None,
            reader: None,
        }
    }

    fn map_open_error(&self, e: &serialport::Error) -> TransportError {
        match e.kind() {
            serialport::ErrorKind::NoDevice => TransportError::PortNotFound(self.config.port.clone()),
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                TransportError::PortNotFound(self.config.port.clone())
            }
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                TransportError::PermissionDenied(self.config.port.clone())
            }
            _ => TransportError::ConnectionFailed(format!("{}: {e}", self.config.port)),
        }
    }
}

fn read_loop(
    mut port: Box<dyn SerialPort>,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
    stop: &AtomicBool,
    stats: &RwLock<TransportStats>,
) {
    let mut buffer = vec![0u8; READ_CHUNK];
    while !stop.load(Ordering::Relaxed) {
        match port.read(&mut buffer) {
            Ok(0) => {
                let _ = tx.blocking_send(Err(std::io::ErrorKind::UnexpectedEof.into()));
                break;
            }
            Ok(n) => {
                {
                    let mut stats = stats.write();
                    stats.bytes_received += n as u64;
                    stats.reads += 1;
                }
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buffer[..n]))).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                break;
            }
        }
    }
}

#[async_trait]
impl TransportTrait for SerialTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .open()
            .map_err(|e| self.map_open_error(&e))?;

        let reader_port = port
            .try_clone()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (tx, rx) = mpsc::channel(RX_QUEUE_DEPTH);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_stats = Arc::clone(&self.stats);
        let name = format!("serial-rx {}", self.config.port);
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || read_loop(reader_port, &tx, &thread_stop, &thread_stats))?;

        *self.port.lock() = Some(port);
        *self.stats.write() = TransportStats::default();
        self.rx = Some(rx);
        self.reader = Some(Reader { stop, handle });

        debug!(port = %self.config.port, baud = self.config.baud_rate, "serial port opened");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        *self.port.lock() = None;
        self.rx = None;

        if let Some(reader) = self.reader.take() {
            reader.stop.store(true, Ordering::Relaxed);
            // The reader wakes up within one read timeout.
            if tokio::task::spawn_blocking(move || reader.handle.join()).await.is_err() {
                warn!(port = %self.config.port, "serial reader thread panicked");
            }
        }
        debug!(port = %self.config.port, "serial port closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.lock().is_some()
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let mut port_guard = self.port.lock();
        let port = port_guard.as_mut().ok_or(TransportError::NotConnected)?;

        port.write_all(data)?;
        port.flush()?;

        let mut stats = self.stats.write();
        stats.bytes_sent += data.len() as u64;
        stats.writes += 1;

        Ok(data.len())
    }

    async fn receive(&mut self) -> Result<Bytes, TransportError> {
        let rx = self.rx.as_mut().ok_or(TransportError::NotConnected)?;
        match rx.recv().await {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(TransportError::Disconnected),
            Some(Err(e)) => Err(TransportError::IoError(e)),
            None => Err(TransportError::Disconnected),
        }
    }

    fn connection_info(&self) -> String {
        format!("{} @ {} baud", self.config.port, self.config.baud_rate)
    }

    fn stats(&self) -> TransportStats {
        *self.stats.read()
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

/// List ports whose USB descriptor matches the CatSniffer VID/PID
pub fn catsniffer_ports() -> Result<Vec<SerialPortInfo>, TransportError> {
    Ok(list_ports()?
        .into_iter()
        .filter(|info| {
            matches!(&info.port_type, SerialPortType::UsbPort(usb)
                if usb.vid == CATSNIFFER_VID && usb.pid == CATSNIFFER_PID)
        })
        .collect())
}
