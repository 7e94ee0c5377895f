//! Command/response correlation over one serial endpoint
//!
//! An [`Endpoint`] owns a transport through a background actor task. The
//! actor writes queued commands one at a time, matches inbound lines (or raw
//! chunks) against the command in flight, retransmits on timeout, and hands
//! everything else to the endpoint's data handler.

use super::protocol::lora::{self, UnitStart};
use super::transport::{TransportError, TransportTrait};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Default per-attempt command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);
/// Default number of retransmissions after the first attempt
pub const DEFAULT_RETRIES: u32 = 1;

const QUEUE_DEPTH: usize = 64;
const MAX_LINE_LEN: usize = 8192;

/// Endpoint connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Not connected
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Connected and serving commands
    Connected,
    /// Transport failed
    Error,
}

/// How inbound bytes are split into units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Newline terminated text
    Lines,
    /// LoRa data port: text lines mixed with length prefixed binary records
    LoraData,
    /// Each received chunk is one unit
    Raw,
}

/// Whether the endpoint currently accepts commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    /// Commands allowed
    Command,
    /// Device streams telemetry; commands are rejected
    Stream,
}

/// What satisfies a command in flight
#[derive(Debug, Clone)]
pub enum Expect {
    /// First non-empty unit
    FirstLine,
    /// First unit matching the pattern; earlier units are kept in the response
    Pattern(Regex),
    /// Nothing; the command succeeds once its timeout elapses
    Quiet,
}

/// Outbound command
#[derive(Debug, Clone)]
pub struct Command {
    label: String,
    payload: Bytes,
    timeout: Duration,
    retries: u32,
    expect: Expect,
}

impl Command {
    /// Text command, sent with a CRLF terminator
    pub fn line(text: impl Into<String>) -> Self {
        let label = text.into();
        let payload = Bytes::from(format!("{label}\r\n"));
        Self::with_payload(label, payload)
    }

    /// Binary command, sent verbatim
    pub fn raw(bytes: impl Into<Bytes>) -> Self {
        let payload = bytes.into();
        Self::with_payload(hex::encode(&payload), payload)
    }

    fn with_payload(label: String, payload: Bytes) -> Self {
        Self {
            label,
            payload,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            retries: DEFAULT_RETRIES,
            expect: Expect::FirstLine,
        }
    }

    /// Per-attempt timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Retransmissions after the first attempt
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Response matcher
    #[must_use]
    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    /// Response must match `pattern`; an invalid pattern falls back to the first line
    #[must_use]
    pub fn expect_pattern(self, pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(re) => self.expect(Expect::Pattern(re)),
            Err(e) => {
                warn!(pattern, error = %e, "invalid response pattern");
                self
            }
        }
    }

    /// Fire and forget, paced by the timeout
    #[must_use]
    pub fn quiet(self) -> Self {
        self.expect(Expect::Quiet)
    }

    /// Printable form
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Successful command outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Command label
    pub command: String,
    /// Response text (lines joined with `\n`), empty for quiet commands
    pub response: String,
    /// Transmissions used
    pub attempts: u32,
    /// Time from first transmission to resolution
    pub elapsed: Duration,
}

/// Command failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Endpoint is not connected
    #[error("{0} is not connected")]
    NotConnected(String),

    /// Endpoint is streaming telemetry
    #[error("{0} is in stream mode; switch to command mode first")]
    ModeGuard(String),

    /// No response before the last attempt timed out
    #[error("no response to '{command}' after {attempts} attempt(s)")]
    Timeout {
        /// Command label
        command: String,
        /// Transmissions made
        attempts: u32,
    },

    /// Transport failed while the command was pending
    #[error("transport error: {0}")]
    Transport(String),

    /// Endpoint shut down before the command resolved
    #[error("endpoint closed")]
    Closed,
}

/// Receiver for units not consumed by a command
pub type DataHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

struct Pending {
    command: Command,
    reply: oneshot::Sender<Result<CommandResponse, CommandError>>,
}

struct InFlight {
    pending: Pending,
    attempts: u32,
    started: Instant,
    deadline: Instant,
    lines: Vec<String>,
}

impl InFlight {
    fn resolve(self, result: Result<String, CommandError>) {
        let Pending { command, reply } = self.pending;
        let outcome = result.map(|response| CommandResponse {
            command: command.label,
            response,
            attempts: self.attempts,
            elapsed: self.started.elapsed(),
        });
        // Caller may have given up.
        let _ = reply.send(outcome);
    }

    /// Offer an inbound unit; returns the unit back if it was not consumed
    fn offer(&mut self, text: &str) -> Offer {
        match &self.pending.command.expect {
            Expect::Quiet => Offer::Ignored,
            Expect::FirstLine => {
                if text.trim().is_empty() {
                    Offer::Ignored
                } else {
                    Offer::Done(text.trim().to_string())
                }
            }
            Expect::Pattern(re) => {
                self.lines.push(text.trim().to_string());
                if re.is_match(text) {
                    Offer::Done(self.lines.join("\n"))
                } else {
                    Offer::Ignored
                }
            }
        }
    }
}

enum Offer {
    Done(String),
    Ignored,
}

/// Cloneable command interface to a connected endpoint
#[derive(Clone)]
pub struct EndpointHandle {
    name: Arc<str>,
    state: Arc<RwLock<EndpointState>>,
    mode: Arc<RwLock<EndpointMode>>,
    tx: Arc<RwLock<Option<mpsc::Sender<Pending>>>>,
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .field("mode", &*self.mode.read())
            .finish_non_exhaustive()
    }
}

impl EndpointHandle {
    /// Endpoint name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state
    pub fn state(&self) -> EndpointState {
        *self.state.read()
    }

    /// Current mode
    pub fn mode(&self) -> EndpointMode {
        *self.mode.read()
    }

    /// Switch between command and stream mode
    pub fn set_mode(&self, mode: EndpointMode) {
        let mut current = self.mode.write();
        if *current != mode {
            debug!(endpoint = %self.name, ?mode, "mode changed");
            *current = mode;
        }
    }

    /// Queue a command and wait for its outcome
    pub async fn send_command(&self, command: Command) -> Result<CommandResponse, CommandError> {
        if self.state() != EndpointState::Connected {
            return Err(CommandError::NotConnected(self.name.to_string()));
        }
        if self.mode() == EndpointMode::Stream {
            return Err(CommandError::ModeGuard(self.name.to_string()));
        }
        // Clone out of the lock; it must not be held across the send.
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or_else(|| CommandError::NotConnected(self.name.to_string()))?;

        let (reply, rx) = oneshot::channel();
        tx.send(Pending { command, reply })
            .await
            .map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)?
    }
}

/// One logical serial endpoint
pub struct Endpoint {
    handle: EndpointHandle,
    kind: EndpointKind,
    transport: Option<Box<dyn TransportTrait>>,
    handler: Option<DataHandler>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Box<dyn TransportTrait>>>,
}

impl Endpoint {
    /// Endpoint over an unopened transport
    pub fn new(name: &str, kind: EndpointKind, transport: Box<dyn TransportTrait>) -> Self {
        Self {
            handle: EndpointHandle {
                name: Arc::from(name),
                state: Arc::new(RwLock::new(EndpointState::Disconnected)),
                mode: Arc::new(RwLock::new(EndpointMode::Command)),
                tx: Arc::new(RwLock::new(None)),
            },
            kind,
            transport: Some(transport),
            handler: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Start in the given mode
    #[must_use]
    pub fn with_mode(self, mode: EndpointMode) -> Self {
        self.handle.set_mode(mode);
        self
    }

    /// Register the unsolicited data handler; handed to the actor on connect
    pub fn on_data(&mut self, handler: DataHandler) {
        self.handler = Some(handler);
    }

    /// Command handle; usable once connected
    pub fn handle(&self) -> EndpointHandle {
        self.handle.clone()
    }

    /// Endpoint name
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Current state
    pub fn state(&self) -> EndpointState {
        self.handle.state()
    }

    /// Switch between command and stream mode
    pub fn set_mode(&self, mode: EndpointMode) {
        self.handle.set_mode(mode);
    }

    /// Queue a command and wait for its outcome
    pub async fn send_command(&self, command: Command) -> Result<CommandResponse, CommandError> {
        self.handle.send_command(command).await
    }

    /// Open the transport and start the actor
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if self.task.is_some() {
            return Ok(());
        }
        let mut transport = self.transport.take().ok_or(TransportError::NotConnected)?;
        *self.handle.state.write() = EndpointState::Connecting;

        if let Err(e) = transport.connect().await {
            warn!(endpoint = %self.name(), error = %e, "connect failed");
            *self.handle.state.write() = EndpointState::Error;
            self.transport = Some(transport);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        *self.handle.tx.write() = Some(tx);
        self.cancel = CancellationToken::new();

        let actor = Actor {
            name: Arc::clone(&self.handle.name),
            kind: self.kind,
            state: Arc::clone(&self.handle.state),
            mode: Arc::clone(&self.handle.mode),
            handler: self.handler.take(),
            cancel: self.cancel.clone(),
        };
        *self.handle.state.write() = EndpointState::Connected;
        debug!(endpoint = %self.name(), info = %transport.connection_info(), "endpoint connected");
        self.task = Some(tokio::spawn(actor.run(transport, rx)));
        Ok(())
    }

    /// Stop the actor and close the transport
    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.cancel.cancel();
        self.handle.tx.write().take();

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(transport) => self.transport = Some(transport),
                Err(e) => warn!(endpoint = %self.name(), error = %e, "endpoint task failed"),
            }
        }

        let result = match self.transport.as_mut() {
            Some(transport) if transport.is_connected() => {
                let stats = transport.stats();
                debug!(
                    endpoint = %self.handle.name,
                    sent = stats.bytes_sent,
                    received = stats.bytes_received,
                    "closing transport"
                );
                transport.disconnect().await
            }
            _ => Ok(()),
        };
        *self.handle.state.write() = EndpointState::Disconnected;
        debug!(endpoint = %self.name(), "endpoint disconnected");
        result
    }
}

struct Actor {
    name: Arc<str>,
    kind: EndpointKind,
    state: Arc<RwLock<EndpointState>>,
    mode: Arc<RwLock<EndpointMode>>,
    handler: Option<DataHandler>,
    cancel: CancellationToken,
}

impl Actor {
    async fn run(
        self,
        mut transport: Box<dyn TransportTrait>,
        mut rx: mpsc::Receiver<Pending>,
    ) -> Box<dyn TransportTrait> {
        let mut inflight: Option<InFlight> = None;
        let mut partial = BytesMut::new();
        let idle = Duration::from_secs(3600);

        loop {
            let deadline = inflight
                .as_ref()
                .map_or_else(|| Instant::now() + idle, |f| f.deadline);

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                received = transport.receive() => match received {
                    Ok(chunk) => {
                        for unit in self.split(&mut partial, chunk) {
                            self.dispatch(&mut inflight, unit);
                        }
                    }
                    Err(e) => {
                        warn!(endpoint = %self.name, error = %e, "transport receive failed");
                        *self.state.write() = EndpointState::Error;
                        if let Some(f) = inflight.take() {
                            f.resolve(Err(CommandError::Transport(e.to_string())));
                        }
                        break;
                    }
                },

                () = sleep_until(deadline), if inflight.is_some() => {
                    if let Some(f) = inflight.take() {
                        inflight = self.on_deadline(transport.as_mut(), f).await;
                    }
                }

                Some(pending) = rx.recv(), if inflight.is_none() => {
                    inflight = self.start(transport.as_mut(), pending).await;
                }
            }
        }

        if let Some(f) = inflight.take() {
            f.resolve(Err(CommandError::Closed));
        }
        transport
    }

    async fn transmit(&self, transport: &mut dyn TransportTrait, command: &Command) -> Result<(), TransportError> {
        trace!(endpoint = %self.name, command = %command.label, "tx");
        transport.send(&command.payload).await.map(|_| ())
    }

    async fn start(&self, transport: &mut dyn TransportTrait, pending: Pending) -> Option<InFlight> {
        // Mode may have flipped while the command sat in the queue.
        if *self.mode.read() == EndpointMode::Stream {
            let _ = pending.reply.send(Err(CommandError::ModeGuard(self.name.to_string())));
            return None;
        }
        if let Err(e) = self.transmit(transport, &pending.command).await {
            warn!(endpoint = %self.name, command = %pending.command.label, error = %e, "send failed");
            let _ = pending.reply.send(Err(CommandError::Transport(e.to_string())));
            return None;
        }
        let now = Instant::now();
        Some(InFlight {
            deadline: now + pending.command.timeout,
            pending,
            attempts: 1,
            started: now,
            lines: Vec::new(),
        })
    }

    async fn on_deadline(&self, transport: &mut dyn TransportTrait, mut f: InFlight) -> Option<InFlight> {
        let command = &f.pending.command;
        if matches!(command.expect, Expect::Quiet) {
            f.resolve(Ok(String::new()));
            return None;
        }
        if f.attempts > command.retries {
            debug!(endpoint = %self.name, command = %command.label, attempts = f.attempts, "command timed out");
            let err = CommandError::Timeout {
                command: command.label.clone(),
                attempts: f.attempts,
            };
            f.resolve(Err(err));
            return None;
        }

        debug!(endpoint = %self.name, command = %command.label, attempt = f.attempts + 1, "retrying");
        if let Err(e) = self.transmit(transport, command).await {
            f.resolve(Err(CommandError::Transport(e.to_string())));
            return None;
        }
        f.attempts += 1;
        f.lines.clear();
        f.deadline = Instant::now() + f.pending.command.timeout;
        Some(f)
    }

    fn split(&self, partial: &mut BytesMut, chunk: Bytes) -> Vec<Bytes> {
        match self.kind {
            EndpointKind::Raw => vec![chunk],
            EndpointKind::Lines | EndpointKind::LoraData => {
                partial.extend_from_slice(&chunk);
                let mut units = Vec::new();
                loop {
                    if self.kind == EndpointKind::LoraData {
                        match lora::unit_start(partial) {
                            UnitStart::Text => {}
                            // Bounded by the u16 length field.
                            UnitStart::Pending => return units,
                            UnitStart::Binary(len) if partial.len() < len => return units,
                            UnitStart::Binary(len) => {
                                units.push(partial.split_to(len).freeze());
                                continue;
                            }
                        }
                    }
                    let Some(pos) = partial.iter().position(|&b| b == b'\n') else {
                        break;
                    };
                    let mut line = partial.split_to(pos + 1);
                    line.truncate(pos);
                    if line.last() == Some(&b'\r') {
                        line.truncate(pos - 1);
                    }
                    if !line.is_empty() {
                        units.push(line.freeze());
                    }
                }
                if partial.len() > MAX_LINE_LEN {
                    warn!(endpoint = %self.name, len = partial.len(), "line too long, flushing");
                    units.push(partial.split().freeze());
                }
                units
            }
        }
    }

    fn dispatch(&self, inflight: &mut Option<InFlight>, unit: Bytes) {
        if let Some(f) = inflight.as_mut() {
            let text = String::from_utf8_lossy(&unit);
            if let Offer::Done(response) = f.offer(&text) {
                trace!(endpoint = %self.name, response = %response, "command satisfied");
                if let Some(f) = inflight.take() {
                    f.resolve(Ok(response));
                }
                return;
            }
        }
        if let Some(handler) = &self.handler {
            handler(unit);
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::MemoryTransport;

    async fn connected(kind: EndpointKind) -> (Endpoint, MemoryTransport, mpsc::UnboundedReceiver<Bytes>) {
        let (host, mut device) = MemoryTransport::pair();
        device.connect().await.unwrap();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let mut endpoint = Endpoint::new("shell", kind, Box::new(host));
        endpoint.on_data(Arc::new(move |unit| {
            let _ = data_tx.send(unit);
        }));
        endpoint.connect().await.unwrap();
        (endpoint, device, data_rx)
    }

    async fn nothing_sent(device: &mut MemoryTransport) -> bool {
        tokio::time::timeout(Duration::from_millis(100), device.receive())
            .await
            .is_err()
    }

    #[tokio::test]
    async fn test_not_connected() {
        let (host, _device) = MemoryTransport::pair();
        let endpoint = Endpoint::new("shell", EndpointKind::Lines, Box::new(host));
        let result = endpoint.send_command(Command::line("status")).await;
        assert_eq!(result, Err(CommandError::NotConnected("shell".to_string())));
        assert_eq!(endpoint.state(), EndpointState::Disconnected);
    }

    #[tokio::test]
    async fn test_first_line_response() {
        let (endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        let handle = endpoint.handle();
        let call = tokio::spawn(async move { handle.send_command(Command::line("lora_freq 915000000")).await });

        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"lora_freq 915000000\r\n"));
        device.send(b"\r\nFrequency set\r\n").await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.response, "Frequency set");
        assert_eq!(response.attempts, 1);
    }

    #[tokio::test]
    async fn test_handle_taken_before_connect() {
        let (host, mut device) = MemoryTransport::pair();
        device.connect().await.unwrap();
        let mut endpoint = Endpoint::new("shell", EndpointKind::Lines, Box::new(host));
        let handle = endpoint.handle();
        endpoint.connect().await.unwrap();

        let call = tokio::spawn(async move { handle.send_command(Command::line("lora_apply")).await });
        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"lora_apply\r\n"));
        device.send(b"Configuration applied\r\n").await.unwrap();
        assert_eq!(call.await.unwrap().unwrap().response, "Configuration applied");

        endpoint.disconnect().await.unwrap();
        assert_eq!(
            endpoint.send_command(Command::line("status")).await,
            Err(CommandError::NotConnected("shell".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_one_retry() {
        let (endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        let handle = endpoint.handle();
        let call = tokio::spawn(async move {
            handle
                .send_command(Command::line("status").timeout(Duration::from_secs(2)).retries(1))
                .await
        });

        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"status\r\n"));
        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"status\r\n"));

        let result = call.await.unwrap();
        assert_eq!(
            result,
            Err(CommandError::Timeout {
                command: "status".to_string(),
                attempts: 2
            })
        );
        assert!(nothing_sent(&mut device).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_command_in_flight() {
        let (endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        let mut calls = Vec::new();
        for text in ["lora_sf 9", "lora_bw 250", "lora_cr 6"] {
            let handle = endpoint.handle();
            calls.push(tokio::spawn(async move { handle.send_command(Command::line(text)).await }));
            tokio::task::yield_now().await;
        }

        for expected in ["lora_sf 9\r\n", "lora_bw 250\r\n", "lora_cr 6\r\n"] {
            assert_eq!(device.receive().await.unwrap(), Bytes::from(expected));
            assert!(nothing_sent(&mut device).await);
            device.send(b"OK\r\n").await.unwrap();
        }

        for call in calls {
            assert_eq!(call.await.unwrap().unwrap().response, "OK");
        }
    }

    #[tokio::test]
    async fn test_mode_guard_writes_nothing() {
        let (endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        endpoint.set_mode(EndpointMode::Stream);

        let result = endpoint.send_command(Command::line("lora_config")).await;
        assert_eq!(result, Err(CommandError::ModeGuard("shell".to_string())));
        assert!(nothing_sent(&mut device).await);

        endpoint.set_mode(EndpointMode::Command);
        let handle = endpoint.handle();
        let call = tokio::spawn(async move { handle.send_command(Command::line("lora_config")).await });
        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"lora_config\r\n"));
        device.send(b"ok\n").await.unwrap();
        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mode_guard_rechecked_for_queued_commands() {
        let (endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        let first = endpoint.handle();
        let second = endpoint.handle();
        let call1 = tokio::spawn(async move { first.send_command(Command::line("lora_apply")).await });
        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"lora_apply\r\n"));

        let call2 = tokio::spawn(async move { second.send_command(Command::line("status")).await });
        tokio::task::yield_now().await;
        endpoint.set_mode(EndpointMode::Stream);
        device.send(b"applied\r\n").await.unwrap();

        assert!(call1.await.unwrap().is_ok());
        assert_eq!(call2.await.unwrap(), Err(CommandError::ModeGuard("shell".to_string())));
        assert!(nothing_sent(&mut device).await);
    }

    #[tokio::test]
    async fn test_pattern_collects_lines() {
        let (endpoint, mut device, mut data) = connected(EndpointKind::Lines).await;
        let handle = endpoint.handle();
        let call = tokio::spawn(async move {
            handle
                .send_command(Command::line("lora_config").expect_pattern("Frequency:"))
                .await
        });

        device.receive().await.unwrap();
        device.send(b"LoRa Configuration:\r\n  Frequency: 915000000\r\n").await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.response, "LoRa Configuration:\nFrequency: 915000000");
        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"LoRa Configuration:"));
    }

    #[tokio::test]
    async fn test_unsolicited_lines_reach_handler() {
        let (_endpoint, mut device, mut data) = connected(EndpointKind::Lines).await;
        device.send(b"RX: 0102 | RSSI: -40 | SNR: 3\r\nRX: 03").await.unwrap();
        device.send(b" | RSSI: -41 | SNR: 2\n").await.unwrap();

        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"RX: 0102 | RSSI: -40 | SNR: 3"));
        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"RX: 03 | RSSI: -41 | SNR: 2"));
    }

    #[tokio::test]
    async fn test_binary_record_kept_whole() {
        use crate::core::protocol::{Dissector, LoraDissector};

        let (_endpoint, mut device, mut data) = connected(EndpointKind::LoraData).await;
        let mut record = vec![0x40, 0x53, 0x00, 0x00, 13, 0x00, 0x01, 0x0A, 0x02];
        record.extend_from_slice(&(-70.0f32).to_le_bytes());
        record.extend_from_slice(&3.0f32.to_le_bytes());
        record.extend_from_slice(&[0x40, 0x45, b'\r', b'\n']);

        device.send(&record[..8]).await.unwrap();
        device.send(&record[8..]).await.unwrap();
        device.send(b"RX: 0B | RSSI: -40 | SNR: 3\r\n").await.unwrap();

        let unit = data.recv().await.unwrap();
        assert_eq!(unit.as_ref(), &record[..record.len() - 2]);
        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(b"RX: 0B | RSSI: -40 | SNR: 3"));

        let mut dissector = LoraDissector::new();
        dissector.push(&unit);
        let packet = dissector.next_packet().unwrap().unwrap();
        assert_eq!(packet.payload.as_ref(), &[0x01, 0x0A, 0x02]);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let (mut endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        endpoint.disconnect().await.unwrap();
        assert_eq!(endpoint.state(), EndpointState::Disconnected);

        endpoint.connect().await.unwrap();
        let handle = endpoint.handle();
        let call = tokio::spawn(async move { handle.send_command(Command::line("status")).await });
        assert_eq!(device.receive().await.unwrap(), Bytes::from_static(b"status\r\n"));
        device.send(b"Mode: command\r\n").await.unwrap();
        assert_eq!(call.await.unwrap().unwrap().response, "Mode: command");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_raw_command() {
        let (endpoint, mut device, mut data) = connected(EndpointKind::Raw).await;
        let handle = endpoint.handle();
        let call = tokio::spawn(async move {
            handle
                .send_command(Command::raw(Bytes::from_static(&[0x40, 0x53])).quiet().timeout(Duration::from_millis(100)))
                .await
        });

        device.receive().await.unwrap();
        device.send(&[0x40, 0x53, 0xC0]).await.unwrap();

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.response, "");
        assert_eq!(response.command, "4053");
        assert_eq!(data.recv().await.unwrap(), Bytes::from_static(&[0x40, 0x53, 0xC0]));
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending() {
        let (mut endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        let handle = endpoint.handle();
        let call = tokio::spawn(async move { handle.send_command(Command::line("status")).await });
        device.receive().await.unwrap();

        endpoint.disconnect().await.unwrap();
        assert_eq!(call.await.unwrap(), Err(CommandError::Closed));
        assert_eq!(endpoint.state(), EndpointState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_loss_sets_error() {
        let (endpoint, mut device, _data) = connected(EndpointKind::Lines).await;
        device.hang_up();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(endpoint.state(), EndpointState::Error);
        assert!(matches!(
            endpoint.send_command(Command::line("status")).await,
            Err(CommandError::NotConnected(_))
        ));
    }
}
