//! Device wire protocols
//!
//! Provides frame extraction and dissection for the two sniffer families:
//! - Framed binary (TI SmartRF packet sniffer firmware, `@S` ... `@E`)
//! - ASCII lines (SX1262 LoRa firmware, `RX: <hex> | RSSI: n | SNR: n`)

pub mod framing;
pub mod lora;
pub mod ti;

pub use framing::{Frame, FrameExtractor, END_MARKER, MAX_FRAME_LEN, START_MARKER};
pub use lora::{LoraDissector, ShellCommand};
pub use ti::{FramedDissector, FramedVariant, Phy, TiCommand};

use crate::core::packet::{DissectError, Packet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sniffer family; picks dissector and capture link type once per session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// Framed binary firmware (IEEE 802.15.4 / BLE)
    Framed,
    /// ASCII line firmware (LoRa)
    AsciiLora,
}

impl DeviceFamily {
    /// Dissector for this family
    pub fn dissector(self, variant: FramedVariant) -> Box<dyn Dissector> {
        match self {
            Self::Framed => Box::new(FramedDissector::new(variant)),
            Self::AsciiLora => Box::new(LoraDissector::new()),
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framed => write!(f, "framed"),
            Self::AsciiLora => write!(f, "lora"),
        }
    }
}

/// Streaming packet dissector
///
/// `push` takes one inbound unit as delivered by the telemetry endpoint: a
/// raw chunk for the framed family, one line (terminator removed) for LoRa.
pub trait Dissector: Send {
    /// Feed one inbound unit
    fn push(&mut self, unit: &[u8]);

    /// Next dissection result; `Err` means a unit was discarded
    fn next_packet(&mut self) -> Option<Result<Packet, DissectError>>;

    /// Family handled by this dissector
    fn family(&self) -> DeviceFamily;
}
