//! LoRa sniffer protocol (SX1262 firmware)
//!
//! Received packets arrive one per line on the data port:
//! `RX: <hex> | RSSI: <int> | SNR: <int>`. Older firmware emits a marker
//! framed binary record instead. Configuration goes through CRLF terminated
//! shell commands on the config port.

use super::framing::{END_MARKER, START_MARKER};
use super::{DeviceFamily, Dissector};
use crate::core::packet::{Category, DissectError, Packet, Signal};
use bytes::Bytes;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, trace};

/// Startup text printed by the firmware on its ports
pub const BANNERS: &[&str] = &["Catsniffer Firmware Ready", "LoRa Control Port"];

/// Allowed bandwidths in kHz
pub const BANDWIDTHS_KHZ: [u16; 3] = [125, 250, 500];
/// Allowed spreading factors
pub const SPREADING_FACTORS: std::ops::RangeInclusive<u8> = 7..=12;
/// Allowed coding rate denominators (4/5 .. 4/8)
pub const CODING_RATES: std::ops::RangeInclusive<u8> = 5..=8;

const BINARY_HEADER_LEN: usize = 6;
const BINARY_TRAILER_LEN: usize = 10;

fn rx_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"RX:\s*([0-9A-Fa-f. ]+?)\s*\|\s*RSSI:\s*(-?\d+)\s*\|\s*SNR:\s*(-?\d+)").ok())
        .as_ref()
}

/// Invalid radio parameter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {name}: {value} (allowed: {allowed})")]
pub struct ParamError {
    /// Parameter name
    pub name: &'static str,
    /// Rejected value
    pub value: String,
    /// Human readable allowed set
    pub allowed: &'static str,
}

impl ParamError {
    /// Error for `name` rejecting `value`
    pub fn new(name: &'static str, value: impl fmt::Display, allowed: &'static str) -> Self {
        Self {
            name,
            value: value.to_string(),
            allowed,
        }
    }
}

/// Firmware radio mode of the data port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    /// Data port streams received packets
    Stream,
    /// Data port accepts commands
    Command,
}

impl fmt::Display for RadioMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream => write!(f, "stream"),
            Self::Command => write!(f, "command"),
        }
    }
}

/// Shell commands understood by the LoRa firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    /// `lora_freq <hz>`
    Frequency(u32),
    /// `lora_bw <khz>`
    Bandwidth(u16),
    /// `lora_sf <n>`
    SpreadingFactor(u8),
    /// `lora_cr <n>`
    CodingRate(u8),
    /// `lora_power <dbm>`
    TxPower(i8),
    /// `lora_apply`
    Apply,
    /// `lora_mode stream|command`
    Mode(RadioMode),
    /// `lora_config`
    Config,
    /// `status`
    Status,
}

impl ShellCommand {
    /// Checked bandwidth command
    pub fn bandwidth(khz: u16) -> Result<Self, ParamError> {
        if BANDWIDTHS_KHZ.contains(&khz) {
            Ok(Self::Bandwidth(khz))
        } else {
            Err(ParamError::new("bandwidth", khz, "125, 250, 500"))
        }
    }

    /// Checked spreading factor command
    pub fn spreading_factor(sf: u8) -> Result<Self, ParamError> {
        if SPREADING_FACTORS.contains(&sf) {
            Ok(Self::SpreadingFactor(sf))
        } else {
            Err(ParamError::new("spreading factor", sf, "7-12"))
        }
    }

    /// Checked coding rate command
    pub fn coding_rate(cr: u8) -> Result<Self, ParamError> {
        if CODING_RATES.contains(&cr) {
            Ok(Self::CodingRate(cr))
        } else {
            Err(ParamError::new("coding rate", cr, "5-8"))
        }
    }

    /// Command text without terminator
    pub fn text(&self) -> String {
        match self {
            Self::Frequency(hz) => format!("lora_freq {hz}"),
            Self::Bandwidth(khz) => format!("lora_bw {khz}"),
            Self::SpreadingFactor(sf) => format!("lora_sf {sf}"),
            Self::CodingRate(cr) => format!("lora_cr {cr}"),
            Self::TxPower(dbm) => format!("lora_power {dbm}"),
            Self::Apply => "lora_apply".to_string(),
            Self::Mode(mode) => format!("lora_mode {mode}"),
            Self::Config => "lora_config".to_string(),
            Self::Status => "status".to_string(),
        }
    }

    /// Response pattern for commands whose reply spans several lines or is
    /// preceded by echo; `None` means the first non-empty line answers.
    pub fn response_pattern(&self) -> Option<&'static str> {
        match self {
            Self::Apply => Some(r"(?i)applied|success"),
            Self::Mode(_) => Some(r"(?i)command|stream"),
            Self::Config => Some(r"LoRa Configuration:|Frequency:"),
            Self::Status => Some(r"Mode:|Band:"),
            _ => None,
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// SX127x-style bandwidth index carried in capture records
pub fn bandwidth_code(khz: u16) -> Option<u8> {
    match khz {
        125 => Some(7),
        250 => Some(8),
        500 => Some(9),
        _ => None,
    }
}

/// Whether a line is firmware startup text
pub fn is_banner(line: &str) -> bool {
    BANNERS.iter().any(|b| line.starts_with(b))
}

/// Parse an ASCII `RX:` line.
///
/// Returns `None` for lines that are not packet reports.
pub fn parse_text(line: &str) -> Option<Result<Packet, DissectError>> {
    let caps = rx_pattern()?.captures(line)?;
    // Firmware truncates long payloads with "...".
    let mut hex_str: String = caps[1].chars().filter(|c| !c.is_whitespace() && *c != '.').collect();
    if hex_str.len() % 2 != 0 {
        hex_str.pop();
    }

    Some(text_packet(&hex_str, &caps[2], &caps[3]))
}

fn text_packet(hex_str: &str, rssi: &str, snr: &str) -> Result<Packet, DissectError> {
    let payload = hex::decode(hex_str).map_err(|e| DissectError::Malformed(e.to_string()))?;
    let rssi: i16 = rssi
        .parse()
        .map_err(|_| DissectError::Malformed(format!("bad RSSI: {rssi}")))?;
    let snr: i16 = snr
        .parse()
        .map_err(|_| DissectError::Malformed(format!("bad SNR: {snr}")))?;
    let declared_len =
        u16::try_from(payload.len()).map_err(|_| DissectError::Malformed("payload too long".to_string()))?;
    Ok(Packet {
        category: Category::DataStreaming,
        packet_type: 0,
        payload: Bytes::from(payload),
        rssi: Some(Signal::Int(rssi)),
        snr: Some(Signal::Int(snr)),
        status: None,
        timestamp_us: None,
        declared_len,
    })
}

fn f32_at(raw: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

/// Parse a marker framed binary LoRa record:
/// `@S | reserved(2) | length(2 LE) | payload | rssi f32 | snr f32 | @E`
pub fn parse_binary(raw: &[u8]) -> Result<Packet, DissectError> {
    let min = BINARY_HEADER_LEN + BINARY_TRAILER_LEN;
    if raw.len() < min {
        return Err(DissectError::Truncated { needed: min, got: raw.len() });
    }
    if !raw.starts_with(&START_MARKER) || !raw.ends_with(&END_MARKER) {
        return Err(DissectError::Markers);
    }

    let declared_len = u16::from_le_bytes([raw[4], raw[5]]);
    let payload = &raw[BINARY_HEADER_LEN..raw.len() - BINARY_TRAILER_LEN];
    let expected = usize::from(declared_len).saturating_sub(BINARY_TRAILER_LEN);
    if payload.len() != expected {
        return Err(DissectError::LengthMismatch {
            declared: usize::from(declared_len),
            actual: payload.len() + BINARY_TRAILER_LEN,
        });
    }

    let trailer = raw.len() - BINARY_TRAILER_LEN;
    Ok(Packet {
        category: Category::DataStreaming,
        packet_type: 0,
        payload: Bytes::copy_from_slice(payload),
        rssi: Some(Signal::Float(f32_at(raw, trailer))),
        snr: Some(Signal::Float(f32_at(raw, trailer + 4))),
        status: None,
        timestamp_us: None,
        declared_len,
    })
}

/// How a buffered data port unit begins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStart {
    /// Text, ending at the next newline
    Text,
    /// Binary record whose header has not fully arrived
    Pending,
    /// Binary record of this many bytes, both markers included
    Binary(usize),
}

/// Classify the start of `buf`.
///
/// Binary records are length prefixed and may carry `\n` in their payload,
/// so they must be cut by their declared length, never at a newline.
pub fn unit_start(buf: &[u8]) -> UnitStart {
    let marker = &START_MARKER[..buf.len().min(START_MARKER.len())];
    if buf.is_empty() || !buf.starts_with(marker) {
        return UnitStart::Text;
    }
    if buf.len() < BINARY_HEADER_LEN {
        return UnitStart::Pending;
    }
    UnitStart::Binary(BINARY_HEADER_LEN + usize::from(u16::from_le_bytes([buf[4], buf[5]])))
}

/// Line oriented LoRa dissector
#[derive(Debug, Default)]
pub struct LoraDissector {
    ready: VecDeque<Result<Packet, DissectError>>,
    ignored: u64,
}

impl LoraDissector {
    /// Create a dissector
    pub fn new() -> Self {
        Self::default()
    }

    /// Lines dropped as banners or chatter
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    fn dissect_line(&mut self, line: &[u8]) -> Option<Result<Packet, DissectError>> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            return None;
        }
        if line.starts_with(&START_MARKER) {
            return Some(parse_binary(line));
        }

        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if is_banner(text) {
            debug!(line = %text, "firmware banner");
            return None;
        }
        parse_text(text)
    }
}

impl Dissector for LoraDissector {
    fn push(&mut self, unit: &[u8]) {
        match self.dissect_line(unit) {
            Some(result) => self.ready.push_back(result),
            None => {
                self.ignored += 1;
                trace!(line = %String::from_utf8_lossy(unit), "ignoring line");
            }
        }
    }

    fn next_packet(&mut self) -> Option<Result<Packet, DissectError>> {
        self.ready.pop_front()
    }

    fn family(&self) -> DeviceFamily {
        DeviceFamily::AsciiLora
    }
}
