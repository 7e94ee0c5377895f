//! Catbridge - CatSniffer extcap bridge
//!
//! Wireshark runs this binary to list the CatSniffer interfaces and, with
//! `--capture`, to stream sniffed packets into its capture pipe.

use anyhow::Context;
use catbridge_core::cli::extcap::{self, Interface};
use catbridge_core::cli::{CliResult, ExitCodes};
use catbridge_core::config::BridgeConfig;
use catbridge_core::core::logger::{init_logging, parse_level, LogForwarder};
use catbridge_core::core::protocol::Phy;
use catbridge_core::core::session::{CaptureSession, ControlChannels, DeviceLink, SessionConfig};
use catbridge_core::core::sink::platform_sink;
use catbridge_core::core::transport::{SerialConfig, SerialTransport, TransportTrait};
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};

/// Log output format on stderr
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// CatSniffer extcap bridge
#[derive(Parser, Debug)]
#[command(name = "catbridge", version, about = "CatSniffer to Wireshark extcap bridge", long_about = None)]
struct Cli {
    /// List interfaces and toolbar controls
    #[arg(long)]
    extcap_interfaces: bool,

    /// List link types for an interface
    #[arg(long)]
    extcap_dlts: bool,

    /// List configuration arguments for an interface
    #[arg(long)]
    extcap_config: bool,

    /// Run a capture
    #[arg(long)]
    capture: bool,

    /// Interface to work on
    #[arg(long)]
    extcap_interface: Option<String>,

    /// Analyzer version
    #[arg(long)]
    extcap_version: Option<String>,

    /// Capture filter (not supported, ignored)
    #[arg(long, hide = true)]
    extcap_capture_filter: Option<String>,

    /// Capture pipe path
    #[arg(long)]
    fifo: Option<String>,

    /// Toolbar to bridge control pipe
    #[arg(long)]
    extcap_control_in: Option<PathBuf>,

    /// Bridge to toolbar control pipe
    #[arg(long)]
    extcap_control_out: Option<PathBuf>,

    /// LoRa shell port
    #[arg(long)]
    shell_port: Option<String>,

    /// LoRa data port
    #[arg(long)]
    lora_port: Option<String>,

    /// Framed sniffer bridge port
    #[arg(long)]
    bridge_port: Option<String>,

    /// LoRa frequency in Hz
    #[arg(long)]
    frequency: Option<u32>,

    /// LoRa bandwidth in kHz
    #[arg(long)]
    bandwidth: Option<u16>,

    /// LoRa spreading factor
    #[arg(long)]
    spread_factor: Option<u8>,

    /// LoRa coding rate denominator
    #[arg(long)]
    coding_rate: Option<u8>,

    /// LoRa transmit power in dBm
    #[arg(long, allow_negative_numbers = true)]
    tx_power: Option<i8>,

    /// Framed sniffer channel
    #[arg(long)]
    channel: Option<u16>,

    /// Framed sniffer PHY index (18 = IEEE 802.15.4, 19 = BLE 1M)
    #[arg(long)]
    phy: Option<u8>,

    /// Log level (DEBUG, INFO, WARNING, ERROR)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Configuration file
    #[arg(long, env = "CATBRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    fn interface(&self) -> Result<Interface, CliResult> {
        match self.extcap_interface.as_deref() {
            None => Ok(Interface::Lora),
            Some(name) => Interface::from_name(name).ok_or_else(|| CliResult::invalid_args(format!("unknown interface: {name}"))),
        }
    }

    /// Radio settings from the file, overridden by flags
    fn session_config(&self, config: &BridgeConfig, interface: Interface) -> Result<SessionConfig, CliResult> {
        let mut session = config.session(interface.family());
        let lora = &mut session.context.lora;
        if let Some(hz) = self.frequency {
            lora.frequency_hz = hz;
        }
        if let Some(khz) = self.bandwidth {
            lora.bandwidth_khz = khz;
        }
        if let Some(sf) = self.spread_factor {
            lora.spreading_factor = sf;
        }
        if let Some(cr) = self.coding_rate {
            lora.coding_rate = cr;
        }
        if let Some(dbm) = self.tx_power {
            lora.tx_power_dbm = dbm;
        }

        let framed = &mut session.context.framed;
        if let Some(index) = self.phy {
            framed.phy = Phy::from_index(index).ok_or_else(|| CliResult::invalid_args(format!("unsupported PHY: {index}")))?;
        }
        if let Some(channel) = self.channel {
            framed.channel = channel;
        }
        Ok(session)
    }

    fn device_link(&self, config: &BridgeConfig, interface: Interface) -> Result<DeviceLink, CliResult> {
        let read_timeout = Duration::from_millis(config.serial.read_timeout_ms);
        let serial = |port: &str, baud: u32| -> Box<dyn TransportTrait> {
            Box::new(SerialTransport::new(SerialConfig::new(port, baud).read_timeout(read_timeout)))
        };
        let required = |port: &Option<String>, flag: &str| {
            port.clone()
                .ok_or_else(|| CliResult::invalid_args(format!("{flag} is required for {}", interface.name())))
        };

        Ok(match interface {
            Interface::Lora => DeviceLink::Lora {
                shell: serial(&required(&self.shell_port, "--shell-port")?, config.serial.lora_baud),
                data: serial(&required(&self.lora_port, "--lora-port")?, config.serial.lora_baud),
            },
            Interface::Ti => DeviceLink::Framed {
                bridge: serial(&required(&self.bridge_port, "--bridge-port")?, config.serial.framed_baud),
            },
        })
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<BridgeConfig, CliResult> {
    let loaded = match path {
        Some(path) => BridgeConfig::load_from(path),
        None => BridgeConfig::load(),
    };
    loaded.map_err(CliResult::from)
}

/// Fire `cancel` on ctrl-c or SIGTERM
#[cfg(unix)]
fn install_stop_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        info!("stop requested");
        cancel.cancel();
    });
    Ok(())
}

/// Fire `cancel` on ctrl-c
#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn install_stop_handler(cancel: CancellationToken) -> anyhow::Result<()> {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("stop requested");
        cancel.cancel();
    });
    Ok(())
}

fn print(text: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{text}").context("writing to stdout")?;
    stdout.flush().context("flushing stdout")
}

async fn capture(cli: &Cli, config: &BridgeConfig, interface: Interface, forwarder: LogForwarder) -> anyhow::Result<CliResult> {
    let session_config = match cli.session_config(config, interface) {
        Ok(session_config) => session_config,
        Err(result) => return Ok(result),
    };
    let link = match cli.device_link(config, interface) {
        Ok(link) => link,
        Err(result) => return Ok(result),
    };
    let fifo = cli.fifo.clone().unwrap_or_else(|| config.capture.fifo.clone());

    // The analyzer blocks until its control pipes are opened.
    let control = match ControlChannels::open(cli.extcap_control_in.as_deref(), cli.extcap_control_out.as_deref()).await {
        Ok(control) => control,
        Err(e) => {
            error!(error = %e, "failed to open control pipes");
            return Ok(CliResult::from(e));
        }
    };

    let cancel = CancellationToken::new();
    install_stop_handler(cancel.clone())?;

    info!(interface = interface.name(), %fifo, "starting capture");
    let session = CaptureSession::new(session_config, link, platform_sink(&fifo))
        .with_control(control)
        .with_log_forwarder(forwarder);
    Ok(match session.run(cancel).await {
        Ok(stats) => CliResult::success_with_message(format!(
            "captured {} packets ({} units, {} discarded)",
            stats.packets, stats.units, stats.discarded
        )),
        Err(e) => CliResult::from(e),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    let level_name = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.capture.log_level.clone()))
        .unwrap_or_default();
    let forwarder = init_logging(parse_level(&level_name).unwrap_or(Level::INFO), cli.log_format == LogFormat::Json);
    if let Some(version) = &cli.extcap_version {
        tracing::debug!(%version, "analyzer version");
    }

    let result = match (config, cli.interface()) {
        (Err(result), _) | (_, Err(result)) => result,
        (Ok(config), Ok(interface)) => {
            if cli.extcap_interfaces {
                print(&extcap::interfaces())?;
                CliResult::success()
            } else if cli.extcap_dlts {
                print(&extcap::dlts(interface))?;
                CliResult::success()
            } else if cli.extcap_config {
                print(&extcap::config(interface, &extcap::detected_ports()))?;
                CliResult::success()
            } else if cli.capture {
                capture(&cli, &config, interface, forwarder).await?
            } else {
                CliResult::invalid_args("no operation given (--extcap-interfaces, --extcap-dlts, --extcap-config or --capture)")
            }
        }
    };

    match &result {
        CliResult::Success(Some(message)) => info!("{message}"),
        CliResult::Error(code, message) => eprintln!("catbridge: {message} ({})", ExitCodes::describe(*code)),
        CliResult::Success(None) => {}
    }
    Ok(result.to_exit_code())
}
