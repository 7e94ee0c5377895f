//! Toolbar control channel
//!
//! Messages exchanged with the analyzer's toolbar over two one-way pipes.
//! Each message is a 6-byte header followed by its payload:
//!
//! ```text
//! 'T' | len[23:16] | len[15:0] (BE) | control | command | payload
//! ```
//!
//! `len` counts the payload plus the control and command bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::{debug, trace};

/// Header sentinel byte
pub const SENTINEL: u8 = b'T';
/// Header length in bytes
pub const HEADER_LEN: usize = 6;
/// Largest payload a message may carry
pub const MAX_PAYLOAD: usize = 65_535;

/// Well-known control numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls;

impl Controls {
    /// Log window
    pub const LOGGER: u8 = 0;
    /// LoRa frequency in Hz
    pub const FREQUENCY: u8 = 1;
    /// LoRa spreading factor
    pub const SPREADING_FACTOR: u8 = 2;
    /// LoRa bandwidth in kHz
    pub const BANDWIDTH: u8 = 3;
    /// LoRa coding rate
    pub const CODING_RATE: u8 = 4;
    /// LoRa transmit power in dBm
    pub const TX_POWER: u8 = 5;
    /// Framed device channel
    pub const CHANNEL: u8 = 6;
}

/// Control message command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlCommand {
    /// Toolbar is ready
    Initialized = 0,
    /// Set a control value
    Set = 1,
    /// Append a value (or a log line)
    Add = 2,
    /// Remove a value
    Remove = 3,
    /// Enable a control
    Enable = 4,
    /// Disable a control
    Disable = 5,
    /// Status bar text
    Statusbar = 6,
    /// Information popup
    Information = 7,
    /// Warning popup
    Warning = 8,
    /// Error popup
    Error = 9,
}

impl ControlCommand {
    /// Command for a raw byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Initialized,
            1 => Self::Set,
            2 => Self::Add,
            3 => Self::Remove,
            4 => Self::Enable,
            5 => Self::Disable,
            6 => Self::Statusbar,
            7 => Self::Information,
            8 => Self::Warning,
            9 => Self::Error,
            _ => return None,
        })
    }
}

/// Control channel errors
#[derive(Error, Debug)]
pub enum ControlError {
    /// Header or payload does not follow the framing rules
    #[error("malformed control message: {0}")]
    Malformed(String),

    /// Command or control number does not fit in a byte
    #[error("{field} {value} out of range 0..=255")]
    OutOfRange {
        /// Which field
        field: &'static str,
        /// Rejected value
        value: u32,
    },

    /// Payload above 65 535 bytes
    #[error("payload of {0} bytes exceeds {MAX_PAYLOAD}")]
    PayloadTooLong(usize),

    /// Peer closed the channel between messages
    #[error("control channel closed")]
    Eof,

    /// I/O failure
    #[error("control channel I/O: {0}")]
    Io(#[from] io::Error),
}

/// One control channel message
#[derive(Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Command byte
    pub command: u8,
    /// Control number
    pub control: u8,
    /// Payload
    pub payload: Bytes,
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlMessage")
            .field("command", &self.command)
            .field("control", &self.control)
            .field("payload", &self.text())
            .finish()
    }
}

impl ControlMessage {
    /// Message with a known command
    pub fn new(command: ControlCommand, control: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            command: command as u8,
            control,
            payload: payload.into(),
        }
    }

    /// `SET` on a control
    pub fn set(control: u8, value: impl fmt::Display) -> Self {
        Self::new(ControlCommand::Set, control, value.to_string())
    }

    /// Log line for the logger control
    pub fn log(line: &str) -> Self {
        Self::new(ControlCommand::Add, Controls::LOGGER, format!("{line}\n"))
    }

    /// Status bar text
    pub fn statusbar(text: &str) -> Self {
        Self::new(ControlCommand::Statusbar, Controls::LOGGER, text.to_string())
    }

    /// Decoded command, if known
    pub fn kind(&self) -> Option<ControlCommand> {
        ControlCommand::from_byte(self.command)
    }

    /// Payload as text
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Wire form
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        put_message(&mut out, self.command, self.control, &self.payload);
        out.freeze()
    }
}

fn put_message(out: &mut BytesMut, command: u8, control: u8, payload: &[u8]) {
    let len = payload.len() + 2;
    out.reserve(HEADER_LEN + payload.len());
    out.put_u8(SENTINEL);
    out.put_u8(((len >> 16) & 0xFF) as u8);
    out.put_u16((len & 0xFFFF) as u16);
    out.put_u8(control);
    out.put_u8(command);
    out.put_slice(payload);
}

/// Encode a message, range-checking command, control number and payload
pub fn encode(command: u32, control: u32, payload: &[u8]) -> Result<Bytes, ControlError> {
    let command = u8::try_from(command).map_err(|_| ControlError::OutOfRange {
        field: "command",
        value: command,
    })?;
    let control = u8::try_from(control).map_err(|_| ControlError::OutOfRange {
        field: "control",
        value: control,
    })?;
    if payload.len() > MAX_PAYLOAD {
        return Err(ControlError::PayloadTooLong(payload.len()));
    }
    let mut out = BytesMut::new();
    put_message(&mut out, command, control, payload);
    Ok(out.freeze())
}

/// Validate a header; returns `(payload_len, control, command)`
pub fn decode_header(header: &[u8; HEADER_LEN]) -> Result<(usize, u8, u8), ControlError> {
    if header[0] != SENTINEL {
        return Err(ControlError::Malformed(format!("bad sentinel 0x{:02X}", header[0])));
    }
    let declared = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
    if declared < 2 {
        return Err(ControlError::Malformed(format!("declared length {declared} < 2")));
    }
    let payload_len = declared - 2;
    if payload_len > MAX_PAYLOAD {
        return Err(ControlError::Malformed(format!("payload length {payload_len} too long")));
    }
    Ok((payload_len, header[4], header[5]))
}

/// Read the payload announced by `header` from `reader`
pub async fn decode<R>(header: &[u8; HEADER_LEN], reader: &mut R) -> Result<ControlMessage, ControlError>
where
    R: AsyncRead + Unpin,
{
    let (len, control, command) = decode_header(header)?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ControlError::Malformed(format!("payload truncated, expected {len} bytes"))
        } else {
            ControlError::Io(e)
        }
    })?;
    Ok(ControlMessage {
        command,
        control,
        payload: Bytes::from(payload),
    })
}

/// Read one whole message; a clean close before the header is `ControlError::Eof`
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, ControlError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                ControlError::Eof
            } else {
                ControlError::Malformed("header truncated".to_string())
            });
        }
        filled += n;
    }
    decode(&header, reader).await
}

/// Stream codec for control messages
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = ControlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let (len, control, command) = decode_header(&header)?;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(ControlMessage {
            command,
            control,
            payload,
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(ControlError::Malformed(format!("{} trailing bytes at close", src.len()))),
        }
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = ControlError;

    fn encode(&mut self, item: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_PAYLOAD {
            return Err(ControlError::PayloadTooLong(item.payload.len()));
        }
        put_message(dst, item.command, item.control, &item.payload);
        Ok(())
    }
}

/// Message stream from the toolbar
pub type ControlReader<R> = FramedRead<R, ControlCodec>;

/// Wrap a toolbar-to-bridge pipe
pub fn control_reader<R: AsyncRead>(reader: R) -> ControlReader<R> {
    FramedRead::new(reader, ControlCodec)
}

/// Next message, `Ok(None)` when the toolbar closed the channel
pub async fn next_message<R>(reader: &mut ControlReader<R>) -> Result<Option<ControlMessage>, ControlError>
where
    R: AsyncRead + Unpin,
{
    reader.next().await.transpose()
}

/// Cloneable handle for sending messages to the toolbar
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlSender {
    /// Sender plus the receiving end of its queue
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message; dropped silently once the writer has exited
    pub fn send(&self, message: ControlMessage) {
        let _ = self.tx.send(message);
    }

    /// Whether the writer task is still running
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn a writer task draining queued messages into `writer`.
///
/// The task ends once every `ControlSender` clone is dropped.
pub fn spawn_writer<W>(writer: W) -> (ControlSender, JoinHandle<Result<(), ControlError>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sender, mut rx) = ControlSender::channel();
    let task = tokio::spawn(async move {
        let mut framed = FramedWrite::new(writer, ControlCodec);
        while let Some(message) = rx.recv().await {
            trace!(command = message.command, control = message.control, "control tx");
            framed.send(message).await?;
        }
        debug!("control writer closed");
        Ok(())
    });
    (sender, task)
}
