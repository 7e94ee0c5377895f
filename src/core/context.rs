//! Capture context
//!
//! Current radio configuration, stamped into every capture record. The
//! control loop is the only writer; the capture loop takes snapshots.

use crate::core::protocol::lora::{self, ParamError, ShellCommand};
use crate::core::protocol::{DeviceFamily, FramedVariant, Phy};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Framed (TI) radio settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramedSettings {
    /// Radio PHY
    pub phy: Phy,
    /// Channel number
    pub channel: u16,
    /// Board data frame layout
    pub variant: FramedVariant,
}

impl Default for FramedSettings {
    fn default() -> Self {
        Self {
            phy: Phy::Ieee802154,
            channel: 11,
            variant: FramedVariant::Plain,
        }
    }
}

impl FramedSettings {
    /// Centre frequency in MHz, if the channel is valid for the PHY
    pub fn frequency_mhz(&self) -> Option<f64> {
        self.phy.channel_frequency(self.channel)
    }

    /// Centre frequency in kHz, 0 when the channel is out of range
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn frequency_khz(&self) -> u32 {
        self.frequency_mhz().map_or(0, |mhz| (mhz * 1000.0).round() as u32)
    }
}

/// LoRa radio settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraSettings {
    /// Centre frequency in Hz
    pub frequency_hz: u32,
    /// Bandwidth in kHz
    pub bandwidth_khz: u16,
    /// Spreading factor
    pub spreading_factor: u8,
    /// Coding rate denominator (4/x)
    pub coding_rate: u8,
    /// Transmit power in dBm
    pub tx_power_dbm: i8,
}

impl Default for LoraSettings {
    fn default() -> Self {
        Self {
            frequency_hz: 915_000_000,
            bandwidth_khz: 125,
            spreading_factor: 7,
            coding_rate: 5,
            tx_power_dbm: 20,
        }
    }
}

impl LoraSettings {
    /// Range-check every field
    pub fn validate(&self) -> Result<(), ParamError> {
        ShellCommand::bandwidth(self.bandwidth_khz)?;
        ShellCommand::spreading_factor(self.spreading_factor)?;
        ShellCommand::coding_rate(self.coding_rate)?;
        Ok(())
    }

    /// Shell commands that program these settings, before `lora_apply`
    pub fn commands(&self) -> Vec<ShellCommand> {
        vec![
            ShellCommand::Frequency(self.frequency_hz),
            ShellCommand::Bandwidth(self.bandwidth_khz),
            ShellCommand::SpreadingFactor(self.spreading_factor),
            ShellCommand::CodingRate(self.coding_rate),
            ShellCommand::TxPower(self.tx_power_dbm),
        ]
    }

    /// Record a setting the device has been told to use
    pub fn apply(&mut self, command: &ShellCommand) {
        match *command {
            ShellCommand::Frequency(hz) => self.frequency_hz = hz,
            ShellCommand::Bandwidth(khz) => self.bandwidth_khz = khz,
            ShellCommand::SpreadingFactor(sf) => self.spreading_factor = sf,
            ShellCommand::CodingRate(cr) => self.coding_rate = cr,
            ShellCommand::TxPower(dbm) => self.tx_power_dbm = dbm,
            _ => {}
        }
    }

    /// Bandwidth index for capture records
    pub fn bandwidth_code(&self) -> u8 {
        lora::bandwidth_code(self.bandwidth_khz).unwrap_or(0)
    }
}

/// Radio configuration for one capture session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureContext {
    /// Device family
    pub family: DeviceFamily,
    /// Framed family settings
    pub framed: FramedSettings,
    /// LoRa family settings
    pub lora: LoraSettings,
}

impl CaptureContext {
    /// Context with default settings for `family`
    pub fn new(family: DeviceFamily) -> Self {
        Self {
            family,
            framed: FramedSettings::default(),
            lora: LoraSettings::default(),
        }
    }
}

/// Context shared between the control loop (writer) and capture loop (reader)
#[derive(Debug, Clone)]
pub struct SharedContext(Arc<RwLock<CaptureContext>>);

impl SharedContext {
    /// Wrap a context
    pub fn new(context: CaptureContext) -> Self {
        Self(Arc::new(RwLock::new(context)))
    }

    /// Copy of the current context
    pub fn snapshot(&self) -> CaptureContext {
        *self.0.read()
    }

    /// Mutate in place
    pub fn update(&self, f: impl FnOnce(&mut CaptureContext)) {
        f(&mut self.0.write());
    }
}
