//! Capture session
//!
//! One capture from start to stop: serial endpoints, dissector, capture
//! writer and toolbar control channel. Two loops run side by side once the
//! device is configured:
//!
//! - the capture loop turns telemetry into capture records
//! - the control loop applies toolbar changes to the device
//!
//! Whichever way the capture ends, teardown runs in a fixed order: stop the
//! capture loop, ask the device to stop, remove the pipe, close serial.

use super::context::{CaptureContext, SharedContext};
use super::control::{self, ControlCommand, ControlError, ControlMessage, ControlReader, ControlSender, Controls};
use super::endpoint::{Command, CommandError, CommandResponse, DataHandler, Endpoint, EndpointHandle, EndpointKind, EndpointMode};
use super::logger::LogForwarder;
use super::pcap::CaptureWriter;
use super::protocol::lora::{ParamError, RadioMode, ShellCommand};
use super::protocol::{ti, DeviceFamily, Dissector, TiCommand};
use super::sink::{PipeSink, SinkError};
use super::transport::{TransportError, TransportTrait};
use crate::cli::ExitCodes;
use bytes::Bytes;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Boxed toolbar-to-bridge stream
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
/// Boxed bridge-to-toolbar stream
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Session timing and initial radio settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial radio configuration
    pub context: CaptureContext,
    /// Per-attempt timeout for shell commands
    pub command_timeout: Duration,
    /// Retransmissions for shell commands
    pub command_retries: u32,
    /// Upper bound on the device stop request during teardown
    pub stop_timeout: Duration,
    /// Capture loop wake-up interval
    pub read_timeout: Duration,
    /// Gap after each framed device command
    pub command_pacing: Duration,
    /// Telemetry units buffered between endpoint and capture loop
    pub queue_depth: usize,
}

impl SessionConfig {
    /// Defaults around `context`
    pub fn new(context: CaptureContext) -> Self {
        Self {
            context,
            command_timeout: Duration::from_secs(2),
            command_retries: 1,
            stop_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(100),
            command_pacing: Duration::from_millis(100),
            queue_depth: 1024,
        }
    }
}

/// Serial links to the sniffer board
pub enum DeviceLink {
    /// LoRa firmware: a text shell plus a streaming data port
    Lora {
        /// Configuration shell
        shell: Box<dyn TransportTrait>,
        /// Packet stream
        data: Box<dyn TransportTrait>,
    },
    /// Framed sniffer firmware on one bridge port
    Framed {
        /// Command and packet port
        bridge: Box<dyn TransportTrait>,
    },
}

impl DeviceLink {
    /// Device family served by this link
    pub fn family(&self) -> DeviceFamily {
        match self {
            Self::Lora { .. } => DeviceFamily::AsciiLora,
            Self::Framed { .. } => DeviceFamily::Framed,
        }
    }
}

/// Toolbar control pipes; either side may be absent
#[derive(Default)]
pub struct ControlChannels {
    /// Toolbar to bridge
    pub input: Option<BoxedReader>,
    /// Bridge to toolbar
    pub output: Option<BoxedWriter>,
}

impl ControlChannels {
    /// Open the control pipes the analyzer created
    pub async fn open(input: Option<&Path>, output: Option<&Path>) -> io::Result<Self> {
        let output = match output {
            Some(path) => {
                let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
                Some(Box::new(file) as BoxedWriter)
            }
            None => None,
        };
        let input = match input {
            Some(path) => Some(Box::new(tokio::fs::File::open(path).await?) as BoxedReader),
            None => None,
        };
        Ok(Self { input, output })
    }
}

/// Session failures
#[derive(Error, Debug)]
pub enum SessionError {
    /// Serial endpoint could not be opened
    #[error("{endpoint}: {source}")]
    Transport {
        /// Endpoint name
        endpoint: String,
        /// Cause
        #[source]
        source: TransportError,
    },

    /// Capture pipe failed
    #[error("capture pipe: {0}")]
    Sink(#[from] SinkError),

    /// Toolbar channel desynchronized
    #[error(transparent)]
    Control(#[from] ControlError),

    /// Device stopped answering or the link broke mid-command
    #[error("device command failed: {0}")]
    Command(#[from] CommandError),

    /// Radio setting out of range
    #[error(transparent)]
    Setting(#[from] ParamError),

    /// Telemetry endpoint went away
    #[error("lost connection to {0}")]
    DeviceLost(String),
}

impl SessionError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Transport { source, .. } => match source {
                TransportError::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
                TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
                _ => ExitCodes::CONNECTION_FAILED,
            },
            Self::Sink(_) => ExitCodes::PIPE_ERROR,
            Self::Control(_) => ExitCodes::PROTOCOL_ERROR,
            Self::Command(CommandError::Timeout { .. }) => ExitCodes::TIMEOUT,
            Self::Command(_) | Self::DeviceLost(_) => ExitCodes::CONNECTION_FAILED,
            Self::Setting(_) => ExitCodes::CONFIG_ERROR,
        }
    }
}

/// Counters reported when a session ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Telemetry units received
    pub units: u64,
    /// Capture records written
    pub packets: u64,
    /// Command and response frames seen on the telemetry stream
    pub non_data: u64,
    /// Units that failed dissection
    pub discarded: u64,
    /// Toolbar changes applied
    pub reconfigurations: u64,
}

/// One capture session
pub struct CaptureSession {
    config: SessionConfig,
    link: DeviceLink,
    sink: Box<dyn PipeSink>,
    control: ControlChannels,
    forwarder: Option<LogForwarder>,
}

impl CaptureSession {
    /// Session over `link`, writing to `sink`
    pub fn new(config: SessionConfig, link: DeviceLink, sink: Box<dyn PipeSink>) -> Self {
        Self {
            config,
            link,
            sink,
            control: ControlChannels::default(),
            forwarder: None,
        }
    }

    /// Attach toolbar control pipes
    #[must_use]
    pub fn with_control(mut self, control: ControlChannels) -> Self {
        self.control = control;
        self
    }

    /// Copy log lines to the toolbar while the session runs
    #[must_use]
    pub fn with_log_forwarder(mut self, forwarder: LogForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Run until `cancel` fires, the toolbar closes, or a fatal error
    pub async fn run(self, cancel: CancellationToken) -> Result<SessionStats, SessionError> {
        let Self {
            config,
            link,
            sink,
            control,
            forwarder,
        } = self;

        let family = link.family();
        let mut context = config.context;
        context.family = family;
        let shared = SharedContext::new(context);

        let (units_tx, mut units_rx) = mpsc::channel(config.queue_depth);
        let (mut endpoints, radio) = build_radio(link, units_tx, &config);
        let mut writer = CaptureWriter::new(sink, family);
        let mut dissector = family.dissector(context.framed.variant);
        let stop = cancel.child_token();

        let (toolbar, toolbar_task) = match control.output {
            Some(output) => {
                let (sender, task) = control::spawn_writer(output);
                sender.send(ControlMessage::set(Controls::LOGGER, ""));
                (Some(sender), Some(task))
            }
            None => (None, None),
        };
        if let (Some(forwarder), Some(sender)) = (&forwarder, &toolbar) {
            forwarder.attach(sender.clone());
        }
        let reader = control.input.map(control::control_reader);

        info!(%family, "capture session starting");
        let mut stats = SessionStats::default();
        let result = Capture {
            radio: &radio,
            shared: &shared,
            stop: &stop,
            toolbar: toolbar.as_ref(),
            stats: &mut stats,
        }
        .run(&mut endpoints, &mut writer, dissector.as_mut(), &mut units_rx, reader)
        .await;

        if let Err(e) = &result {
            error!(error = %e, "capture failed");
        }
        teardown(&radio, &mut writer, &mut endpoints, &stop).await;

        if let Some(forwarder) = &forwarder {
            forwarder.detach();
        }
        if let Some(sender) = &toolbar {
            let status = match &result {
                Ok(()) => "Capture stopped".to_string(),
                Err(e) => format!("Capture failed: {e}"),
            };
            sender.send(ControlMessage::statusbar(&status));
        }
        drop(toolbar);
        if let Some(task) = toolbar_task {
            match tokio::time::timeout(config.stop_timeout, task).await {
                Ok(Ok(Err(e))) => debug!(error = %e, "toolbar writer failed"),
                Err(_) => debug!("toolbar writer did not finish"),
                _ => {}
            }
        }

        info!(
            units = stats.units,
            packets = stats.packets,
            non_data = stats.non_data,
            discarded = stats.discarded,
            reconfigurations = stats.reconfigurations,
            "capture session ended"
        );
        result.map(|()| stats)
    }
}

fn telemetry_handler(tx: mpsc::Sender<Bytes>) -> DataHandler {
    Arc::new(move |unit| {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(unit) {
            warn!("capture queue full, dropping telemetry");
        }
    })
}

fn build_radio(link: DeviceLink, units: mpsc::Sender<Bytes>, config: &SessionConfig) -> (Vec<Endpoint>, Radio) {
    let (endpoints, handles) = match link {
        DeviceLink::Lora { shell, data } => {
            let mut shell = Endpoint::new("shell", EndpointKind::Lines, shell);
            shell.on_data(Arc::new(|line: Bytes| {
                debug!(line = %String::from_utf8_lossy(&line), "shell");
            }));
            let mut data = Endpoint::new("lora", EndpointKind::LoraData, data).with_mode(EndpointMode::Stream);
            data.on_data(telemetry_handler(units));
            let handles = RadioHandles::Lora {
                shell: shell.handle(),
                data: data.handle(),
            };
            (vec![shell, data], handles)
        }
        DeviceLink::Framed { bridge } => {
            let mut bridge = Endpoint::new("bridge", EndpointKind::Raw, bridge);
            bridge.on_data(telemetry_handler(units));
            let handles = RadioHandles::Framed { bridge: bridge.handle() };
            (vec![bridge], handles)
        }
    };
    (
        endpoints,
        Radio {
            handles,
            config: config.clone(),
        },
    )
}

#[derive(Clone)]
enum RadioHandles {
    Lora { shell: EndpointHandle, data: EndpointHandle },
    Framed { bridge: EndpointHandle },
}

/// Device command side of a session
struct Radio {
    handles: RadioHandles,
    config: SessionConfig,
}

/// Timeouts and mode-guard rejections are logged; anything else ends the session
fn tolerate(result: Result<CommandResponse, CommandError>) -> Result<(), SessionError> {
    match result {
        Ok(response) => {
            trace!(command = %response.command, response = %response.response, attempts = response.attempts, "acknowledged");
            Ok(())
        }
        Err(e @ (CommandError::Timeout { .. } | CommandError::ModeGuard(_))) => {
            warn!(error = %e, "command not acknowledged");
            Ok(())
        }
        Err(e) => Err(SessionError::Command(e)),
    }
}

fn number<T: FromStr>(value: &str, name: &'static str, allowed: &'static str) -> Result<T, ParamError> {
    value.trim().parse().map_err(|_| ParamError::new(name, value.trim(), allowed))
}

/// Shell command for a toolbar SET on a LoRa control
fn lora_setting(control: u8, value: &str) -> Result<Option<ShellCommand>, ParamError> {
    let command = match control {
        Controls::FREQUENCY => ShellCommand::Frequency(number(value, "frequency", "Hz")?),
        Controls::BANDWIDTH => ShellCommand::bandwidth(number(value, "bandwidth", "125, 250, 500")?)?,
        Controls::SPREADING_FACTOR => ShellCommand::spreading_factor(number(value, "spreading factor", "7-12")?)?,
        Controls::CODING_RATE => ShellCommand::coding_rate(number(value, "coding rate", "5-8")?)?,
        Controls::TX_POWER => ShellCommand::TxPower(number(value, "tx power", "dBm")?),
        _ => return Ok(None),
    };
    Ok(Some(command))
}

/// Value the toolbar should show for `control`
fn toolbar_value(context: &CaptureContext, control: u8) -> Option<String> {
    let lora = &context.lora;
    match (context.family, control) {
        (DeviceFamily::AsciiLora, Controls::FREQUENCY) => Some(lora.frequency_hz.to_string()),
        (DeviceFamily::AsciiLora, Controls::BANDWIDTH) => Some(lora.bandwidth_khz.to_string()),
        (DeviceFamily::AsciiLora, Controls::SPREADING_FACTOR) => Some(lora.spreading_factor.to_string()),
        (DeviceFamily::AsciiLora, Controls::CODING_RATE) => Some(lora.coding_rate.to_string()),
        (DeviceFamily::AsciiLora, Controls::TX_POWER) => Some(lora.tx_power_dbm.to_string()),
        (DeviceFamily::Framed, Controls::CHANNEL) => Some(context.framed.channel.to_string()),
        _ => None,
    }
}

/// Controls echoed to the toolbar once the device is configured
fn toolbar_controls(family: DeviceFamily) -> &'static [u8] {
    match family {
        DeviceFamily::AsciiLora => &[
            Controls::FREQUENCY,
            Controls::BANDWIDTH,
            Controls::SPREADING_FACTOR,
            Controls::CODING_RATE,
            Controls::TX_POWER,
        ],
        DeviceFamily::Framed => &[Controls::CHANNEL],
    }
}

impl Radio {
    async fn shell(&self, shell: &EndpointHandle, command: ShellCommand) -> Result<CommandResponse, CommandError> {
        let mut request = Command::line(command.text())
            .timeout(self.config.command_timeout)
            .retries(self.config.command_retries);
        if let Some(pattern) = command.response_pattern() {
            request = request.expect_pattern(pattern);
        }
        shell.send_command(request).await
    }

    async fn framed(&self, bridge: &EndpointHandle, command: TiCommand) -> Result<CommandResponse, CommandError> {
        trace!(?command, "framed command");
        let request = Command::raw(command.encode()).quiet().timeout(self.config.command_pacing);
        bridge.send_command(request).await
    }

    /// Bring the device from idle to streaming
    async fn configure(&self, context: &CaptureContext) -> Result<(), SessionError> {
        match &self.handles {
            RadioHandles::Lora { shell, data } => {
                context.lora.validate()?;
                info!(
                    frequency = context.lora.frequency_hz,
                    bandwidth = context.lora.bandwidth_khz,
                    sf = context.lora.spreading_factor,
                    cr = context.lora.coding_rate,
                    "configuring LoRa radio"
                );
                for command in context.lora.commands() {
                    tolerate(self.shell(shell, command).await)?;
                }
                tolerate(self.shell(shell, ShellCommand::Apply).await)?;
                tolerate(self.shell(shell, ShellCommand::Mode(RadioMode::Stream)).await)?;
                data.set_mode(EndpointMode::Stream);
            }
            RadioHandles::Framed { bridge } => {
                let framed = context.framed;
                if framed.frequency_mhz().is_none() {
                    return Err(ParamError::new("channel", framed.channel, "valid for the selected PHY").into());
                }
                info!(phy = framed.phy.index(), channel = framed.channel, "configuring framed sniffer");
                for command in ti::startup_sequence(framed.phy, framed.channel) {
                    tolerate(self.framed(bridge, command).await)?;
                }
            }
        }
        Ok(())
    }

    /// Apply a toolbar SET; returns the value to echo back, `None` if the control is not ours
    async fn reconfigure(&self, control: u8, value: &str, shared: &SharedContext) -> Result<Option<String>, SessionError> {
        match &self.handles {
            RadioHandles::Lora { shell, data } => {
                let Some(command) = lora_setting(control, value)? else {
                    return Ok(None);
                };
                info!(%command, "reconfiguring");
                data.set_mode(EndpointMode::Command);
                let applied = async {
                    tolerate(self.shell(shell, ShellCommand::Mode(RadioMode::Command)).await)?;
                    tolerate(self.shell(shell, command).await)?;
                    tolerate(self.shell(shell, ShellCommand::Apply).await)?;
                    tolerate(self.shell(shell, ShellCommand::Mode(RadioMode::Stream)).await)
                }
                .await;
                data.set_mode(EndpointMode::Stream);
                applied?;
                shared.update(|ctx| ctx.lora.apply(&command));
            }
            RadioHandles::Framed { bridge } => {
                if control != Controls::CHANNEL {
                    return Ok(None);
                }
                let phy = shared.snapshot().framed.phy;
                let channel: u16 = number(value, "channel", "valid for the selected PHY")?;
                let mhz = phy
                    .channel_frequency(channel)
                    .ok_or_else(|| ParamError::new("channel", channel, "valid for the selected PHY"))?;
                info!(channel, mhz, "retuning");
                // Context first so records after the restart carry the new channel.
                shared.update(|ctx| ctx.framed.channel = channel);
                for command in [TiCommand::Stop, TiCommand::CfgFrequency(mhz), TiCommand::Start] {
                    tolerate(self.framed(bridge, command).await)?;
                }
            }
        }
        Ok(toolbar_value(&shared.snapshot(), control))
    }

    /// Best-effort return to idle, bounded by the stop timeout
    async fn stop_device(&self) {
        let request = async {
            match &self.handles {
                RadioHandles::Lora { shell, data } => {
                    let command = ShellCommand::Mode(RadioMode::Command);
                    let mut request = Command::line(command.text())
                        .timeout(self.config.stop_timeout)
                        .retries(0);
                    if let Some(pattern) = command.response_pattern() {
                        request = request.expect_pattern(pattern);
                    }
                    let result = shell.send_command(request).await;
                    data.set_mode(EndpointMode::Command);
                    result
                }
                RadioHandles::Framed { bridge } => self.framed(bridge, TiCommand::Stop).await,
            }
        };
        match tokio::time::timeout(self.config.stop_timeout * 2, request).await {
            Ok(Ok(_)) => debug!("device stopped"),
            Ok(Err(e)) => warn!(error = %e, "device stop not acknowledged"),
            Err(_) => warn!("device stop timed out"),
        }
    }
}

/// Borrowed state shared by the phases of a running capture
struct Capture<'a> {
    radio: &'a Radio,
    shared: &'a SharedContext,
    stop: &'a CancellationToken,
    toolbar: Option<&'a ControlSender>,
    stats: &'a mut SessionStats,
}

impl Capture<'_> {
    async fn run(
        self,
        endpoints: &mut [Endpoint],
        writer: &mut CaptureWriter,
        dissector: &mut dyn Dissector,
        units: &mut mpsc::Receiver<Bytes>,
        reader: Option<ControlReader<BoxedReader>>,
    ) -> Result<(), SessionError> {
        let mut reader = reader;
        if let Some(reader) = reader.as_mut() {
            info!("waiting for toolbar");
            if !wait_initialized(reader, self.stop).await? {
                return Ok(());
            }
        }

        writer.sink_mut().create().await?;
        for endpoint in endpoints.iter_mut() {
            endpoint.connect().await.map_err(|source| SessionError::Transport {
                endpoint: endpoint.name().to_string(),
                source,
            })?;
        }
        let context = self.shared.snapshot();
        tokio::select! {
            biased;
            () = self.stop.cancelled() => {
                info!("stop requested while configuring");
                return Ok(());
            }
            configured = self.radio.configure(&context) => configured?,
        }

        info!(pipe = %writer.sink_mut().path(), "waiting for capture reader");
        tokio::select! {
            () = self.stop.cancelled() => return Ok(()),
            opened = writer.sink_mut().open_for_write() => opened?,
        }
        writer.ensure_header().await?;

        if let Some(toolbar) = self.toolbar {
            let context = self.shared.snapshot();
            for &control in toolbar_controls(context.family) {
                if let Some(value) = toolbar_value(&context, control) {
                    toolbar.send(ControlMessage::set(control, value));
                }
            }
            toolbar.send(ControlMessage::statusbar("Capturing"));
        }
        info!("capture running");

        let Self {
            radio,
            shared,
            stop,
            toolbar,
            stats,
        } = self;
        let mut reconfigurations = 0;
        let (captured, controlled) = tokio::join!(
            capture_loop(writer, dissector, units, shared, stop, radio.config.read_timeout, stats),
            control_loop(reader, radio, shared, toolbar, stop, &mut reconfigurations),
        );
        stats.reconfigurations = reconfigurations;
        captured.and(controlled)
    }
}

/// Block until the toolbar reports INITIALIZED; `false` if it went away first
async fn wait_initialized(reader: &mut ControlReader<BoxedReader>, stop: &CancellationToken) -> Result<bool, SessionError> {
    loop {
        let message = tokio::select! {
            () = stop.cancelled() => return Ok(false),
            message = control::next_message(reader) => message?,
        };
        match message {
            Some(message) if message.kind() == Some(ControlCommand::Initialized) => {
                debug!("toolbar initialized");
                return Ok(true);
            }
            Some(message) => debug!(?message, "control message before INITIALIZED ignored"),
            None => {
                info!("toolbar closed before initializing");
                return Ok(false);
            }
        }
    }
}

async fn capture_loop(
    writer: &mut CaptureWriter,
    dissector: &mut dyn Dissector,
    units: &mut mpsc::Receiver<Bytes>,
    shared: &SharedContext,
    stop: &CancellationToken,
    read_timeout: Duration,
    stats: &mut SessionStats,
) -> Result<(), SessionError> {
    let result = 'capture: loop {
        let received = tokio::select! {
            () = stop.cancelled() => break Ok(()),
            received = tokio::time::timeout(read_timeout, units.recv()) => received,
        };
        let unit = match received {
            Err(_) => continue,
            Ok(None) => break Err(SessionError::DeviceLost(dissector.family().to_string())),
            Ok(Some(unit)) => unit,
        };

        stats.units += 1;
        dissector.push(&unit);
        while let Some(dissected) = dissector.next_packet() {
            match dissected {
                Ok(packet) if packet.is_data() => {
                    if let Err(e) = writer.write_packet(&packet, &shared.snapshot()).await {
                        break 'capture Err(e.into());
                    }
                    stats.packets += 1;
                }
                Ok(packet) => {
                    stats.non_data += 1;
                    debug!(category = %packet.category, packet_type = packet.packet_type, "non-data frame skipped");
                }
                Err(e) => {
                    stats.discarded += 1;
                    debug!(error = %e, "unit discarded");
                }
            }
        }
    };
    stop.cancel();
    result
}

async fn control_loop(
    reader: Option<ControlReader<BoxedReader>>,
    radio: &Radio,
    shared: &SharedContext,
    toolbar: Option<&ControlSender>,
    stop: &CancellationToken,
    reconfigurations: &mut u64,
) -> Result<(), SessionError> {
    let Some(mut reader) = reader else {
        stop.cancelled().await;
        return Ok(());
    };

    let result = loop {
        let message = tokio::select! {
            () = stop.cancelled() => break Ok(()),
            message = control::next_message(&mut reader) => message,
        };
        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => {
                info!("toolbar closed the control channel");
                break Ok(());
            }
            Err(e) => break Err(SessionError::Control(e)),
        };

        if message.kind() != Some(ControlCommand::Set) {
            debug!(?message, "control message ignored");
            continue;
        }
        match radio.reconfigure(message.control, &message.text(), shared).await {
            Ok(Some(value)) => {
                *reconfigurations += 1;
                if let Some(toolbar) = toolbar {
                    toolbar.send(ControlMessage::set(message.control, value));
                }
            }
            Ok(None) => debug!(control = message.control, "no such control"),
            Err(SessionError::Setting(e)) => {
                warn!(error = %e, "rejected toolbar setting");
                if let (Some(toolbar), Some(value)) = (toolbar, toolbar_value(&shared.snapshot(), message.control)) {
                    toolbar.send(ControlMessage::set(message.control, value));
                }
            }
            Err(e) => break Err(e),
        }
    };
    stop.cancel();
    result
}

async fn teardown(radio: &Radio, writer: &mut CaptureWriter, endpoints: &mut [Endpoint], stop: &CancellationToken) {
    stop.cancel();
    radio.stop_device().await;
    if let Err(e) = writer.sink_mut().remove().await {
        warn!(error = %e, "failed to remove capture pipe");
    }
    for endpoint in endpoints.iter_mut() {
        if let Err(e) = endpoint.disconnect().await {
            warn!(endpoint = %endpoint.name(), error = %e, "failed to close endpoint");
        }
    }
    debug!("teardown complete");
}
