//! Dissected packet record
//!
//! Both device wire formats dissect into the same [`Packet`], which is all
//! the capture encoder needs besides the current capture context.

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Packet category, taken from the top two bits of the framed info byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Reserved / unknown
    Reserved,
    /// Host to device command
    Command,
    /// Device reply to a command
    CommandResponse,
    /// Sniffed radio traffic
    DataStreaming,
}

impl Category {
    /// Decode from an info byte
    pub fn from_info(info: u8) -> Self {
        match (info >> 6) & 0b11 {
            1 => Self::Command,
            2 => Self::CommandResponse,
            3 => Self::DataStreaming,
            _ => Self::Reserved,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved => write!(f, "Reserved"),
            Self::Command => write!(f, "Command"),
            Self::CommandResponse => write!(f, "CommandResponse"),
            Self::DataStreaming => write!(f, "DataStreaming"),
        }
    }
}

/// Signal measurement as reported by the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Signal {
    /// Integer dBm / dB (framed RSSI, LoRa text lines)
    Int(i16),
    /// Float dBm / dB (LoRa binary records)
    Float(f32),
}

impl Signal {
    /// Value as float
    pub fn as_f32(self) -> f32 {
        match self {
            Self::Int(v) => f32::from(v),
            Self::Float(v) => v,
        }
    }

    /// Value saturated into a signed byte
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Int(v) => v.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8,
            Self::Float(v) => v.round().clamp(f32::from(i8::MIN), f32::from(i8::MAX)) as i8,
        }
    }
}

/// A dissected device packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Category
    pub category: Category,
    /// Low six bits of the info byte (0 for LoRa)
    pub packet_type: u8,
    /// Radio payload or command body
    pub payload: Bytes,
    /// Received signal strength
    pub rssi: Option<Signal>,
    /// Signal-to-noise ratio (LoRa only)
    pub snr: Option<Signal>,
    /// Status byte (framed data only)
    pub status: Option<u8>,
    /// Device timestamp in microseconds (timestamped boards only)
    pub timestamp_us: Option<u64>,
    /// Length declared by the frame header
    pub declared_len: u16,
}

impl Packet {
    /// Sniffed traffic that belongs in the capture
    pub fn is_data(&self) -> bool {
        self.category == Category::DataStreaming
    }
}

/// Dissection failure; the offending unit is discarded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DissectError {
    /// Fewer bytes than the fixed layout requires
    #[error("truncated frame: need {needed} bytes, got {got}")]
    Truncated {
        /// Minimum length
        needed: usize,
        /// Actual length
        got: usize,
    },

    /// Declared length disagrees with the frame size
    #[error("length mismatch: header declares {declared}, frame carries {actual}")]
    LengthMismatch {
        /// Declared in header
        declared: usize,
        /// Present in frame
        actual: usize,
    },

    /// Missing start or end marker
    #[error("missing frame markers")]
    Markers,

    /// Unparseable content
    #[error("malformed: {0}")]
    Malformed(String),
}
