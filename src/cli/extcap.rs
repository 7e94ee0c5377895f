//! Extcap listings
//!
//! Text the analyzer reads from stdout when it probes the bridge with
//! `--extcap-interfaces`, `--extcap-dlts` and `--extcap-config`.

use crate::core::control::Controls;
use crate::core::context::{FramedSettings, LoraSettings};
use crate::core::pcap;
use crate::core::protocol::lora::{BANDWIDTHS_KHZ, CODING_RATES, SPREADING_FACTORS};
use crate::core::protocol::{DeviceFamily, Phy};
use crate::core::transport::catsniffer_ports;
use std::fmt::Write as _;
use tracing::debug;

/// Extcap protocol version announced to the analyzer
pub const EXTCAP_VERSION: &str = "3.0";

/// Project page shown in the interface help
pub const HELP_URL: &str = "https://github.com/ElectronicCats/CatSniffer";

/// Capture interfaces offered by the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    /// LoRa firmware, shell plus data port
    Lora,
    /// Framed sniffer firmware, one bridge port
    Ti,
}

impl Interface {
    /// All interfaces in listing order
    pub const ALL: [Self; 2] = [Self::Lora, Self::Ti];

    /// Look up by the `--extcap-interface` value
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.name() == name)
    }

    /// `--extcap-interface` value
    pub fn name(self) -> &'static str {
        match self {
            Self::Lora => "catsniffer_lora",
            Self::Ti => "catsniffer_ti",
        }
    }

    /// Name shown in the interface list
    pub fn display(self) -> &'static str {
        match self {
            Self::Lora => "CatSniffer LoRa",
            Self::Ti => "CatSniffer 802.15.4/BLE",
        }
    }

    /// Device family captured on this interface
    pub fn family(self) -> DeviceFamily {
        match self {
            Self::Lora => DeviceFamily::AsciiLora,
            Self::Ti => DeviceFamily::Framed,
        }
    }

    fn dlt_name(self) -> &'static str {
        match self {
            Self::Lora => "catsniffer_lora_dlt",
            Self::Ti => "catsniffer_ti_dlt",
        }
    }
}

/// One entry of a serial port selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOption {
    /// Value passed back on the command line
    pub device: String,
    /// Label shown in the selector
    pub display: String,
}

/// CatSniffer ports currently attached; empty when enumeration fails
pub fn detected_ports() -> Vec<PortOption> {
    match catsniffer_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let display = format!("CatSniffer - {}", info.port_name);
                PortOption {
                    device: info.port_name,
                    display,
                }
            })
            .collect(),
        Err(e) => {
            debug!(error = %e, "port enumeration failed");
            Vec::new()
        }
    }
}

/// `extcap {version=...}` line
pub fn version_line() -> String {
    format!("extcap {{version={EXTCAP_VERSION}}}{{display=CatSniffer Extcap}}{{help={HELP_URL}}}")
}

/// `--extcap-interfaces` output: interfaces, toolbar controls and their values
pub fn interfaces() -> String {
    let mut out = version_line();
    out.push('\n');
    for interface in Interface::ALL {
        let _ = writeln!(out, "interface {{value={}}}{{display={}}}", interface.name(), interface.display());
    }

    let controls: [(u8, &str, &str, &str); 7] = [
        (Controls::LOGGER, "button", "Log", "{role=logger}"),
        (Controls::FREQUENCY, "string", "Frequency (Hz)", ""),
        (Controls::SPREADING_FACTOR, "selector", "Spreading Factor", ""),
        (Controls::BANDWIDTH, "selector", "Bandwidth (kHz)", ""),
        (Controls::CODING_RATE, "selector", "Coding Rate", ""),
        (Controls::TX_POWER, "string", "TX Power (dBm)", ""),
        (Controls::CHANNEL, "string", "Channel", ""),
    ];
    for (number, kind, display, extra) in controls {
        let _ = writeln!(
            out,
            "control {{number={number}}}{{type={kind}}}{extra}{{display={display}}}{{tooltip={display}}}"
        );
    }

    let lora = LoraSettings::default();
    let _ = writeln!(
        out,
        "value {{control={}}}{{value={}}}{{display={} Hz}}",
        Controls::FREQUENCY,
        lora.frequency_hz,
        lora.frequency_hz
    );
    for sf in SPREADING_FACTORS {
        let _ = writeln!(
            out,
            "value {{control={}}}{{value={sf}}}{{display=SF{sf}}}{}",
            Controls::SPREADING_FACTOR,
            default_flag(sf == lora.spreading_factor)
        );
    }
    for bw in BANDWIDTHS_KHZ {
        let _ = writeln!(
            out,
            "value {{control={}}}{{value={bw}}}{{display={bw} kHz}}{}",
            Controls::BANDWIDTH,
            default_flag(bw == lora.bandwidth_khz)
        );
    }
    for cr in CODING_RATES {
        let _ = writeln!(
            out,
            "value {{control={}}}{{value={cr}}}{{display=4/{cr}}}{}",
            Controls::CODING_RATE,
            default_flag(cr == lora.coding_rate)
        );
    }
    out.truncate(out.trim_end().len());
    out
}

/// `--extcap-dlts` output for one interface
pub fn dlts(interface: Interface) -> String {
    let display = match interface {
        Interface::Lora => "CatSniffer LoRa DLT",
        Interface::Ti => "CatSniffer TI DLT",
    };
    format!(
        "dlt {{number={}}}{{name={}}}{{display={display}}}",
        pcap::link_type(interface.family()),
        interface.dlt_name()
    )
}

/// `--extcap-config` output for one interface
pub fn config(interface: Interface, ports: &[PortOption]) -> String {
    let mut lines = Vec::new();
    match interface {
        Interface::Lora => lora_config(&mut lines, ports),
        Interface::Ti => ti_config(&mut lines, ports),
    }
    lines.join("\n")
}

fn default_flag(is_default: bool) -> &'static str {
    if is_default {
        "{default=true}"
    } else {
        ""
    }
}

fn port_values(lines: &mut Vec<String>, arg: u8, ports: &[PortOption]) {
    for port in ports {
        lines.push(format!("value {{arg={arg}}}{{value={}}}{{display={}}}", port.device, port.display));
    }
}

fn log_level_arg(lines: &mut Vec<String>, number: u8) {
    lines.push(format!(
        "arg {{number={number}}}{{call=--log-level}}{{type=selector}}{{display=Log Level}}{{tooltip=Set the log level}}{{default=INFO}}{{group=Logger}}"
    ));
    for level in ["DEBUG", "INFO", "WARNING", "ERROR"] {
        lines.push(format!(
            "value {{arg={number}}}{{value={level}}}{{display={level}}}{}",
            default_flag(level == "INFO")
        ));
    }
}

fn lora_config(lines: &mut Vec<String>, ports: &[PortOption]) {
    let lora = LoraSettings::default();
    lines.push("arg {number=0}{call=--shell-port}{type=selector}{required=true}{display=Shell Port (Config)}{tooltip=CatSniffer shell port for configuration}".to_string());
    lines.push("arg {number=1}{call=--lora-port}{type=selector}{required=true}{display=LoRa Port (Data)}{tooltip=CatSniffer LoRa port for the data stream}".to_string());
    lines.push(format!(
        "arg {{number=2}}{{call=--frequency}}{{type=long}}{{default={}}}{{display=Frequency (Hz)}}{{tooltip=Frequency in Hz}}",
        lora.frequency_hz
    ));
    lines.push(format!(
        "arg {{number=3}}{{call=--spread-factor}}{{type=selector}}{{default={}}}{{display=Spreading Factor}}{{tooltip=LoRa spreading factor (7-12)}}",
        lora.spreading_factor
    ));
    lines.push(format!(
        "arg {{number=4}}{{call=--bandwidth}}{{type=selector}}{{default={}}}{{display=Bandwidth (kHz)}}{{tooltip=LoRa bandwidth in kHz}}",
        lora.bandwidth_khz
    ));
    lines.push(format!(
        "arg {{number=5}}{{call=--coding-rate}}{{type=selector}}{{default={}}}{{display=Coding Rate}}{{tooltip=LoRa coding rate (5-8)}}",
        lora.coding_rate
    ));
    lines.push(format!(
        "arg {{number=6}}{{call=--tx-power}}{{type=integer}}{{default={}}}{{display=TX Power (dBm)}}{{tooltip=Transmit power in dBm}}",
        lora.tx_power_dbm
    ));
    log_level_arg(lines, 7);

    port_values(lines, 0, ports);
    port_values(lines, 1, ports);
    for sf in SPREADING_FACTORS {
        lines.push(format!(
            "value {{arg=3}}{{value={sf}}}{{display=SF{sf}}}{}",
            default_flag(sf == lora.spreading_factor)
        ));
    }
    for bw in BANDWIDTHS_KHZ {
        lines.push(format!(
            "value {{arg=4}}{{value={bw}}}{{display={bw} kHz}}{}",
            default_flag(bw == lora.bandwidth_khz)
        ));
    }
    for cr in CODING_RATES {
        lines.push(format!(
            "value {{arg=5}}{{value={cr}}}{{display=4/{cr}}}{}",
            default_flag(cr == lora.coding_rate)
        ));
    }
}

fn ti_config(lines: &mut Vec<String>, ports: &[PortOption]) {
    let framed = FramedSettings::default();
    lines.push("arg {number=0}{call=--bridge-port}{type=selector}{required=true}{display=Bridge Port}{tooltip=CatSniffer bridge port}".to_string());
    lines.push(format!(
        "arg {{number=1}}{{call=--phy}}{{type=selector}}{{default={}}}{{display=PHY}}{{tooltip=Radio PHY}}",
        framed.phy.index()
    ));
    lines.push(format!(
        "arg {{number=2}}{{call=--channel}}{{type=integer}}{{range=0,39}}{{default={}}}{{display=Channel}}{{tooltip=802.15.4: 11-26, BLE: 0-39}}",
        framed.channel
    ));
    log_level_arg(lines, 3);

    port_values(lines, 0, ports);
    for (phy, display) in [(Phy::Ieee802154, "IEEE 802.15.4"), (Phy::Ble1m, "BLE 1M")] {
        lines.push(format!(
            "value {{arg=1}}{{value={}}}{{display={display}}}{}",
            phy.index(),
            default_flag(phy == framed.phy)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports() -> Vec<PortOption> {
        vec![PortOption {
            device: "/dev/ttyACM0".to_string(),
            display: "CatSniffer - /dev/ttyACM0".to_string(),
        }]
    }

    #[test]
    fn test_interface_names() {
        assert_eq!(Interface::from_name("catsniffer_lora"), Some(Interface::Lora));
        assert_eq!(Interface::from_name("catsniffer_ti"), Some(Interface::Ti));
        assert_eq!(Interface::from_name("wifi"), None);
        assert_eq!(Interface::Ti.family(), DeviceFamily::Framed);
    }

    #[test]
    fn test_interfaces_listing() {
        let listing = interfaces();
        let mut lines = listing.lines();
        assert!(lines.next().unwrap().starts_with("extcap {version=3.0}"));
        assert!(listing.contains("interface {value=catsniffer_lora}{display=CatSniffer LoRa}"));
        assert!(listing.contains("interface {value=catsniffer_ti}"));
        assert!(listing.contains("control {number=0}{type=button}{role=logger}"));
        assert!(listing.contains("value {control=3}{value=125}{display=125 kHz}{default=true}"));
        assert!(listing.contains("value {control=2}{value=12}{display=SF12}"));
        assert!(!listing.ends_with('\n'));
    }

    #[test]
    fn test_dlts() {
        assert_eq!(
            dlts(Interface::Lora),
            "dlt {number=148}{name=catsniffer_lora_dlt}{display=CatSniffer LoRa DLT}"
        );
        assert!(dlts(Interface::Ti).starts_with("dlt {number=147}"));
    }

    #[test]
    fn test_lora_config() {
        let config = config(Interface::Lora, &ports());
        assert!(config.starts_with("arg {number=0}{call=--shell-port}"));
        assert!(config.contains("{call=--spread-factor}{type=selector}{default=7}"));
        assert!(config.contains("value {arg=0}{value=/dev/ttyACM0}{display=CatSniffer - /dev/ttyACM0}"));
        assert!(config.contains("value {arg=1}{value=/dev/ttyACM0}"));
        assert!(config.contains("value {arg=5}{value=8}{display=4/8}"));
        assert!(config.contains("value {arg=7}{value=INFO}{display=INFO}{default=true}"));
    }

    #[test]
    fn test_ti_config() {
        let config = config(Interface::Ti, &[]);
        assert!(config.starts_with("arg {number=0}{call=--bridge-port}"));
        assert!(config.contains("value {arg=1}{value=18}{display=IEEE 802.15.4}{default=true}"));
        assert!(config.contains("value {arg=1}{value=19}{display=BLE 1M}"));
        assert!(!config.contains("value {arg=0}"));
    }
}
