//! Framed binary sniffer protocol (TI SmartRF packet sniffer firmware)
//!
//! Frame layout: `@S | info | length (LE) | body | [fcs] | @E`.
//! Data frames end their body with RSSI and status; command and response
//! frames carry a one byte FCS after the body.

use super::framing::{Frame, FrameExtractor, END_MARKER, START_MARKER};
use super::{DeviceFamily, Dissector};
use crate::core::packet::{Category, DissectError, Packet, Signal};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use tracing::debug;

const HEADER_LEN: usize = START_MARKER.len() + 3;
const TRAILER_LEN: usize = END_MARKER.len();
const TIMESTAMP_PREFIX_LEN: usize = 7;
const TIMESTAMP_LEN: usize = 6;

/// Low byte of the sum of command byte, both length bytes and payload
pub fn fcs(cmd: u8, data: &[u8]) -> u8 {
    let len = u16::try_from(data.len()).unwrap_or(u16::MAX).to_le_bytes();
    data.iter()
        .chain(len.iter())
        .fold(cmd, |acc, &b| acc.wrapping_add(b))
}

/// Host to device commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TiCommand {
    /// Liveness check
    Ping,
    /// Start streaming sniffed packets
    Start,
    /// Stop streaming
    Stop,
    /// Pause streaming
    Pause,
    /// Resume streaming
    Resume,
    /// Tune the radio, value in MHz
    CfgFrequency(f64),
    /// Select radio PHY by firmware index
    CfgPhy(u8),
}

impl TiCommand {
    /// Command byte
    pub fn code(&self) -> u8 {
        match self {
            Self::Ping => 0x40,
            Self::Start => 0x41,
            Self::Stop => 0x42,
            Self::Pause => 0x43,
            Self::Resume => 0x44,
            Self::CfgFrequency(_) => 0x45,
            Self::CfgPhy(_) => 0x47,
        }
    }

    fn data(&self) -> Vec<u8> {
        match *self {
            Self::CfgFrequency(mhz) => frequency_bytes(mhz).to_vec(),
            Self::CfgPhy(phy) => vec![phy],
            _ => Vec::new(),
        }
    }

    /// Serialize into a complete frame
    pub fn encode(&self) -> Bytes {
        let data = self.data();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len() + 1 + TRAILER_LEN);
        buf.put_slice(&START_MARKER);
        buf.put_u8(self.code());
        buf.put_u16_le(u16::try_from(data.len()).unwrap_or(u16::MAX));
        buf.put_slice(&data);
        buf.put_u8(fcs(self.code(), &data));
        buf.put_slice(&END_MARKER);
        buf.freeze()
    }
}

/// Firmware frequency encoding: integer MHz, then the fraction scaled by 65536
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn frequency_bytes(mhz: f64) -> [u8; 4] {
    let integer = mhz.trunc();
    let fraction = ((mhz - integer) * 65536.0) as u16;
    let integer = (integer as u16).to_le_bytes();
    let fraction = fraction.to_le_bytes();
    [integer[0], integer[1], fraction[0], fraction[1]]
}

/// Radio PHYs supported by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phy {
    /// IEEE 802.15.4 O-QPSK, 2.4 GHz (firmware index 18)
    Ieee802154,
    /// Bluetooth Low Energy 1M (firmware index 19)
    Ble1m,
}

impl Phy {
    /// Look up by firmware index
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            18 => Some(Self::Ieee802154),
            19 => Some(Self::Ble1m),
            _ => None,
        }
    }

    /// Firmware index
    pub fn index(self) -> u8 {
        match self {
            Self::Ieee802154 => 18,
            Self::Ble1m => 19,
        }
    }

    /// Valid channel numbers
    pub fn channels(self) -> RangeInclusive<u16> {
        match self {
            Self::Ieee802154 => 11..=26,
            Self::Ble1m => 0..=39,
        }
    }

    /// Centre frequency of a channel in MHz
    pub fn channel_frequency(self, channel: u16) -> Option<f64> {
        if !self.channels().contains(&channel) {
            return None;
        }
        let mhz = match self {
            Self::Ieee802154 => 2405 + 5 * (channel - 11),
            Self::Ble1m => match channel {
                37 => 2402,
                38 => 2426,
                39 => 2480,
                0..=10 => 2404 + 2 * channel,
                _ => 2428 + 2 * (channel - 11),
            },
        };
        Some(f64::from(mhz))
    }

    /// Protocol tag in the capture record
    pub fn capture_protocol(self) -> u8 {
        match self {
            Self::Ieee802154 => 0x02,
            Self::Ble1m => 0x03,
        }
    }

    /// PHY tag in the capture record
    pub fn capture_phy(self) -> u8 {
        match self {
            Self::Ieee802154 => 0x03,
            Self::Ble1m => 0x05,
        }
    }
}

/// Commands that bring the device from idle to streaming
pub fn startup_sequence(phy: Phy, channel: u16) -> Vec<TiCommand> {
    let mhz = phy
        .channel_frequency(channel)
        .or_else(|| phy.channel_frequency(*phy.channels().start()))
        .unwrap_or_default();
    vec![
        TiCommand::Ping,
        TiCommand::Stop,
        TiCommand::CfgPhy(phy.index()),
        TiCommand::CfgFrequency(mhz),
        TiCommand::Start,
    ]
}

/// Board-specific body layout of data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramedVariant {
    /// Body is payload, RSSI, status
    #[default]
    Plain,
    /// Body over 7 bytes starts with a 7 byte prefix holding a 6 byte µs timestamp
    Timestamped,
}

/// Dissect one framed binary frame
pub fn dissect_frame(frame: &Frame, variant: FramedVariant) -> Result<Packet, DissectError> {
    let raw = frame.as_bytes();
    if raw.len() < HEADER_LEN + TRAILER_LEN {
        return Err(DissectError::Truncated {
            needed: HEADER_LEN + TRAILER_LEN,
            got: raw.len(),
        });
    }
    if !frame.is_valid() {
        return Err(DissectError::Markers);
    }

    let info = raw[2];
    let declared_len = u16::from_le_bytes([raw[3], raw[4]]);
    let declared = usize::from(declared_len);
    let category = Category::from_info(info);
    let packet_type = info & 0x3F;
    let carried = raw.len() - HEADER_LEN - TRAILER_LEN;

    let mut packet = Packet {
        category,
        packet_type,
        payload: Bytes::new(),
        rssi: None,
        snr: None,
        status: None,
        timestamp_us: None,
        declared_len,
    };

    if category != Category::DataStreaming {
        // FCS is optional on inbound command traffic.
        if carried != declared && carried != declared + 1 {
            return Err(DissectError::LengthMismatch { declared, actual: carried });
        }
        packet.payload = Bytes::copy_from_slice(&raw[HEADER_LEN..HEADER_LEN + declared]);
        return Ok(packet);
    }

    if carried != declared {
        return Err(DissectError::LengthMismatch { declared, actual: carried });
    }
    if declared < 2 {
        return Err(DissectError::Truncated { needed: HEADER_LEN + 2 + TRAILER_LEN, got: raw.len() });
    }

    let body = &raw[HEADER_LEN..HEADER_LEN + declared];
    let (meta, tail) = body.split_at(body.len() - 2);
    #[allow(clippy::cast_possible_wrap)]
    let rssi = tail[0] as i8;
    packet.rssi = Some(Signal::Int(i16::from(rssi)));
    packet.status = Some(tail[1]);

    let payload = match variant {
        FramedVariant::Timestamped if body.len() > TIMESTAMP_PREFIX_LEN => {
            let mut ts = [0u8; 8];
            ts[..TIMESTAMP_LEN].copy_from_slice(&body[..TIMESTAMP_LEN]);
            packet.timestamp_us = Some(u64::from_le_bytes(ts));
            // An 8 byte body holds the timestamp and the trailer but no payload.
            meta.get(TIMESTAMP_PREFIX_LEN..).unwrap_or_default()
        }
        _ => meta,
    };
    packet.payload = Bytes::copy_from_slice(payload);
    Ok(packet)
}

/// Framed binary dissector over raw serial chunks
pub struct FramedDissector {
    extractor: FrameExtractor,
    variant: FramedVariant,
}

impl FramedDissector {
    /// Create a dissector for a board variant
    pub fn new(variant: FramedVariant) -> Self {
        Self {
            extractor: FrameExtractor::new(),
            variant,
        }
    }
}

impl Dissector for FramedDissector {
    fn push(&mut self, unit: &[u8]) {
        self.extractor.push(unit);
    }

    fn next_packet(&mut self) -> Option<Result<Packet, DissectError>> {
        let frame = self.extractor.next_frame()?;
        let result = dissect_frame(&frame, self.variant);
        if let Err(ref e) = result {
            debug!(error = %e, frame = %hex::encode(frame.as_bytes()), "discarding frame");
        }
        Some(result)
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::Framed
    }
}
