//! Shared fixtures: an in-memory capture pipe and firmware simulators
//! standing in for the sniffer board on the far end of `MemoryTransport`.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use catbridge_core::core::control::{self, ControlCommand, ControlMessage};
use catbridge_core::core::session::{BoxedReader, BoxedWriter, ControlChannels};
use catbridge_core::core::sink::{PipeSink, SinkError};
use catbridge_core::core::transport::{MemoryTransport, TransportTrait};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct SinkState {
    pub created: bool,
    pub opened: bool,
    pub removed: bool,
    pub reader_gone: bool,
    pub data: Vec<u8>,
}

/// Capture pipe backed by a shared buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub state: Arc<Mutex<SinkState>>,
}

impl MemorySink {
    pub fn boxed(&self) -> Box<dyn PipeSink> {
        Box::new(self.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().data.clone()
    }

    pub fn removed(&self) -> bool {
        self.state.lock().removed
    }

    /// Make every write fail as if the analyzer closed the pipe
    pub fn close_reader(&self) {
        self.state.lock().reader_gone = true;
    }
}

#[async_trait]
impl PipeSink for MemorySink {
    async fn create(&mut self) -> Result<(), SinkError> {
        self.state.lock().created = true;
        Ok(())
    }

    async fn open_for_write(&mut self) -> Result<(), SinkError> {
        self.state.lock().opened = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        if !state.opened {
            return Err(SinkError::NotOpen);
        }
        if state.reader_gone {
            state.opened = false;
            return Err(SinkError::ReaderGone);
        }
        state.data.extend_from_slice(data);
        Ok(())
    }

    async fn remove(&mut self) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        state.opened = false;
        state.removed = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().opened
    }

    fn path(&self) -> String {
        "memory".to_string()
    }
}

/// Poll `check` until it holds
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

/// Analyzer side of the toolbar pipes
pub struct Toolbar {
    pub to_bridge: Option<DuplexStream>,
    pub from_bridge: DuplexStream,
}

impl Toolbar {
    pub fn new() -> (Self, ControlChannels) {
        let (to_bridge, bridge_in) = tokio::io::duplex(4096);
        let (bridge_out, from_bridge) = tokio::io::duplex(4096);
        let channels = ControlChannels {
            input: Some(Box::new(bridge_in) as BoxedReader),
            output: Some(Box::new(bridge_out) as BoxedWriter),
        };
        (
            Self {
                to_bridge: Some(to_bridge),
                from_bridge,
            },
            channels,
        )
    }

    pub async fn send(&mut self, command: ControlCommand, control: u8, payload: &str) {
        let frame = control::encode(command as u32, u32::from(control), payload.as_bytes()).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let stream = self.to_bridge.as_mut().expect("control-in already closed");
        stream.write_all(bytes).await.unwrap();
        stream.flush().await.unwrap();
    }

    /// Close control-in; the bridge treats this as a stop request
    pub fn close(&mut self) {
        self.to_bridge = None;
    }

    pub async fn recv(&mut self) -> ControlMessage {
        tokio::time::timeout(WAIT, control::read_message(&mut self.from_bridge))
            .await
            .expect("no control message from bridge")
            .unwrap()
    }

    /// Read until a message matches, returning everything seen on the way
    pub async fn recv_until(&mut self, mut done: impl FnMut(&ControlMessage) -> bool) -> Vec<ControlMessage> {
        let mut seen = Vec::new();
        loop {
            let message = self.recv().await;
            let finished = done(&message);
            seen.push(message);
            if finished {
                return seen;
            }
        }
    }
}

/// Text received by a simulated shell, one entry per command line
pub type ShellLog = Arc<Mutex<Vec<String>>>;

/// Reported on the data port every time the radio enters stream mode
pub const LORA_RX_LINE: &[u8] = b"RX: 48 65 6C 6C 6F | RSSI: -42 | SNR: 7\r\n";

/// LoRa firmware: answers shell commands and streams one packet per
/// `lora_mode stream`.
pub fn spawn_lora_firmware(mut shell: MemoryTransport, mut data: MemoryTransport) -> (ShellLog, JoinHandle<()>) {
    let log = ShellLog::default();
    let seen = Arc::clone(&log);
    let task = tokio::spawn(async move {
        shell.connect().await.unwrap();
        data.connect().await.unwrap();
        data.send(b"LoRa Control Port\r\n").await.unwrap();

        let mut pending = String::new();
        while let Ok(chunk) = shell.receive().await {
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(end) = pending.find("\r\n") {
                let line: String = pending.drain(..end + 2).collect();
                let line = line.trim().to_string();
                seen.lock().push(line.clone());

                let reply = match line.as_str() {
                    "lora_apply" => "Configuration applied".to_string(),
                    "lora_mode stream" => "Mode: stream".to_string(),
                    "lora_mode command" => "Mode: command".to_string(),
                    other => format!("OK {other}"),
                };
                if shell.send(format!("{reply}\r\n").as_bytes()).await.is_err() {
                    return;
                }
                if line == "lora_mode stream" {
                    let _ = data.send(LORA_RX_LINE).await;
                }
            }
        }
    });
    (log, task)
}

/// Framed sniffer data frame: 5 byte payload, RSSI -40, status 0x80
pub fn framed_data_frame() -> Bytes {
    Bytes::from_static(&[
        0x40, 0x53, 0xC0, 0x07, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xD8, 0x80, 0x40, 0x45,
    ])
}

/// Framed firmware: records command bytes and streams one data frame,
/// preceded by a command response, after every START.
pub fn spawn_framed_firmware(mut bridge: MemoryTransport) -> (Arc<Mutex<Vec<u8>>>, JoinHandle<()>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&codes);
    let task = tokio::spawn(async move {
        bridge.connect().await.unwrap();
        while let Ok(frame) = bridge.receive().await {
            let Some(&code) = frame.get(2) else { continue };
            seen.lock().push(code);
            if code == 0x41 {
                // Command response with its FCS, then sniffed traffic split
                // across two chunks.
                let _ = bridge.send(&[0x40, 0x53, 0x81, 0x01, 0x00, 0x00, 0x82, 0x40, 0x45]).await;
                let data = framed_data_frame();
                let _ = bridge.send(&data[..6]).await;
                let _ = bridge.send(&data[6..]).await;
            }
        }
    });
    (codes, task)
}
