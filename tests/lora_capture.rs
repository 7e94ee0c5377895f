//! LoRa capture sessions against a simulated board

mod common;

use catbridge_core::core::context::CaptureContext;
use catbridge_core::core::control::{ControlCommand, Controls};
use catbridge_core::core::protocol::DeviceFamily;
use catbridge_core::core::session::{CaptureSession, DeviceLink, SessionConfig, SessionError};
use catbridge_core::core::transport::{MemoryTransport, TransportTrait};
use catbridge_core::ExitCodes;
use common::{eventually, spawn_lora_firmware, MemorySink, ShellLog, Toolbar, WAIT};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const HEADER_LEN: usize = 24;
const LORA_RECORD_LEN: usize = 16 + 22 + 5;

struct Rig {
    sink: MemorySink,
    shell_log: ShellLog,
    firmware: JoinHandle<()>,
    session: CaptureSession,
}

fn rig() -> Rig {
    let (shell_host, shell_device) = MemoryTransport::pair();
    let (data_host, data_device) = MemoryTransport::pair();
    let (shell_log, firmware) = spawn_lora_firmware(shell_device, data_device);

    let mut config = SessionConfig::new(CaptureContext::new(DeviceFamily::AsciiLora));
    config.command_timeout = Duration::from_millis(500);
    config.read_timeout = Duration::from_millis(20);

    let sink = MemorySink::default();
    let link = DeviceLink::Lora {
        shell: Box::new(shell_host),
        data: Box::new(data_host),
    };
    let session = CaptureSession::new(config, link, sink.boxed());
    Rig {
        sink,
        shell_log,
        firmware,
        session,
    }
}

fn commands(log: &ShellLog) -> Vec<String> {
    log.lock().clone()
}

#[tokio::test]
async fn test_capture_writes_header_and_records() {
    let Rig {
        sink,
        shell_log,
        firmware,
        session,
    } = rig();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(session.run(cancel.clone()));

    eventually("first record", || sink.len() >= HEADER_LEN + LORA_RECORD_LEN).await;
    cancel.cancel();
    let stats = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert!(stats.packets >= 1);
    assert_eq!(stats.discarded, 0);

    let bytes = sink.bytes();
    assert_eq!(&bytes[..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
    assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 148);

    let body = &bytes[HEADER_LEN + 16..HEADER_LEN + LORA_RECORD_LEN];
    assert_eq!(u16::from_le_bytes([body[1], body[2]]), 5);
    assert_eq!(u32::from_le_bytes(body[7..11].try_into().unwrap()), 915);
    assert_eq!(&body[11..14], &[7, 7, 5]);
    assert_eq!(f32::from_le_bytes(body[14..18].try_into().unwrap()), -42.0);
    assert_eq!(f32::from_le_bytes(body[18..22].try_into().unwrap()), 7.0);
    assert_eq!(&body[22..], b"Hello");

    let sent = commands(&shell_log);
    assert_eq!(
        &sent[..7],
        &[
            "lora_freq 915000000",
            "lora_bw 125",
            "lora_sf 7",
            "lora_cr 5",
            "lora_power 20",
            "lora_apply",
            "lora_mode stream",
        ]
    );
    assert_eq!(sent.last().map(String::as_str), Some("lora_mode command"));
    assert!(sink.removed());
    firmware.abort();
}

#[tokio::test]
async fn test_toolbar_reconfigures_radio() {
    let Rig {
        sink,
        shell_log,
        firmware,
        session,
    } = rig();
    let (mut toolbar, channels) = Toolbar::new();
    let running = tokio::spawn(session.with_control(channels).run(CancellationToken::new()));

    let logger_reset = toolbar.recv().await;
    assert_eq!(logger_reset.kind(), Some(ControlCommand::Set));
    assert_eq!(logger_reset.control, Controls::LOGGER);
    assert!(logger_reset.payload.is_empty());

    // Nothing touches the device before the toolbar is ready.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(commands(&shell_log).is_empty());

    toolbar.send(ControlCommand::Initialized, 0, "").await;
    let startup = toolbar
        .recv_until(|m| m.kind() == Some(ControlCommand::Statusbar))
        .await;
    let echoed: Vec<(u8, String)> = startup
        .iter()
        .filter(|m| m.kind() == Some(ControlCommand::Set))
        .map(|m| (m.control, m.text().into_owned()))
        .collect();
    assert!(echoed.contains(&(Controls::FREQUENCY, "915000000".to_string())));
    assert!(echoed.contains(&(Controls::SPREADING_FACTOR, "7".to_string())));
    assert_eq!(startup.last().unwrap().text(), "Capturing");

    toolbar.send(ControlCommand::Set, Controls::SPREADING_FACTOR, "9").await;
    let echo = toolbar.recv_until(|m| m.kind() == Some(ControlCommand::Set)).await;
    let echo = echo.last().unwrap();
    assert_eq!(echo.control, Controls::SPREADING_FACTOR);
    assert_eq!(echo.text(), "9");

    let sent = commands(&shell_log);
    let reconfigure = sent.iter().position(|c| c == "lora_sf 9").expect("lora_sf 9 not sent");
    assert_eq!(sent[reconfigure - 1], "lora_mode command");
    assert_eq!(sent[reconfigure + 1], "lora_apply");
    assert_eq!(sent[reconfigure + 2], "lora_mode stream");

    // An out of range value leaves the radio alone and re-echoes the current one.
    toolbar.send(ControlCommand::Set, Controls::BANDWIDTH, "300").await;
    let echo = toolbar.recv_until(|m| m.kind() == Some(ControlCommand::Set)).await;
    assert_eq!(echo.last().unwrap().text(), "125");
    assert!(!commands(&shell_log).iter().any(|c| c == "lora_bw 300"));

    toolbar.close();
    let stats = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(stats.reconfigurations, 1);
    assert!(sink.len() >= HEADER_LEN + LORA_RECORD_LEN);
    assert_eq!(commands(&shell_log).last().map(String::as_str), Some("lora_mode command"));
    assert!(sink.removed());

    let farewell = toolbar.recv_until(|m| m.kind() == Some(ControlCommand::Statusbar)).await;
    assert_eq!(farewell.last().unwrap().text(), "Capture stopped");
    firmware.abort();
}

#[tokio::test]
async fn test_malformed_control_message_stops_capture() {
    let Rig {
        sink,
        shell_log,
        firmware,
        session,
    } = rig();
    let (mut toolbar, channels) = Toolbar::new();
    let running = tokio::spawn(session.with_control(channels).run(CancellationToken::new()));

    toolbar.send(ControlCommand::Initialized, 0, "").await;
    toolbar.recv_until(|m| m.text() == "Capturing").await;
    toolbar.send_raw(b"X\x00\x00\x02\x01\x01").await;

    let err = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, SessionError::Control(_)));
    assert_eq!(err.exit_code(), ExitCodes::PROTOCOL_ERROR);
    assert_eq!(commands(&shell_log).last().map(String::as_str), Some("lora_mode command"));
    assert!(sink.removed());
    firmware.abort();
}

#[tokio::test]
async fn test_toolbar_gone_before_initialized() {
    let Rig {
        sink,
        shell_log,
        firmware,
        session,
    } = rig();
    let (mut toolbar, channels) = Toolbar::new();
    let running = tokio::spawn(session.with_control(channels).run(CancellationToken::new()));

    toolbar.recv().await;
    toolbar.close();
    let stats = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(stats.packets, 0);
    assert!(!sink.state.lock().created);
    assert!(!commands(&shell_log).iter().any(|c| c.starts_with("lora_freq")));
    firmware.abort();
}

#[tokio::test]
async fn test_data_port_loss_ends_session() {
    let (shell_host, mut shell_device) = MemoryTransport::pair();
    let (data_host, mut data_device) = MemoryTransport::pair();
    let firmware = tokio::spawn(async move {
        shell_device.connect().await.unwrap();
        data_device.connect().await.unwrap();
        while let Ok(chunk) = shell_device.receive().await {
            let reply: &[u8] = if chunk.starts_with(b"lora_mode") {
                b"Mode: ok stream command\r\n"
            } else if chunk.starts_with(b"lora_apply") {
                b"applied\r\n"
            } else {
                b"OK\r\n"
            };
            let _ = shell_device.send(reply).await;
            if chunk.starts_with(b"lora_mode stream") {
                data_device.hang_up();
            }
        }
    });

    let sink = MemorySink::default();
    let mut config = SessionConfig::new(CaptureContext::new(DeviceFamily::AsciiLora));
    config.command_timeout = Duration::from_millis(200);
    config.stop_timeout = Duration::from_millis(200);
    let link = DeviceLink::Lora {
        shell: Box::new(shell_host),
        data: Box::new(data_host),
    };
    let session = CaptureSession::new(config, link, sink.boxed());

    let err = tokio::time::timeout(WAIT, session.run(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::DeviceLost(_)));
    assert_eq!(err.exit_code(), ExitCodes::CONNECTION_FAILED);
    assert!(sink.removed());
    firmware.abort();
}

#[tokio::test]
async fn test_stop_while_configuring_is_prompt() {
    let (shell_host, mut shell_device) = MemoryTransport::pair();
    let (data_host, _data_device) = MemoryTransport::pair();

    let mut config = SessionConfig::new(CaptureContext::new(DeviceFamily::AsciiLora));
    config.command_timeout = Duration::from_secs(2);
    config.command_retries = 1;
    config.stop_timeout = Duration::from_millis(100);
    let sink = MemorySink::default();
    let link = DeviceLink::Lora {
        shell: Box::new(shell_host),
        data: Box::new(data_host),
    };
    let cancel = CancellationToken::new();
    let started = Instant::now();
    let running = tokio::spawn(CaptureSession::new(config, link, sink.boxed()).run(cancel.clone()));

    // The shell takes the first command and never answers.
    shell_device.connect().await.unwrap();
    let first = tokio::time::timeout(WAIT, shell_device.receive()).await.unwrap().unwrap();
    assert_eq!(&first[..], b"lora_freq 915000000\r\n");
    cancel.cancel();

    let stats = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "stop took {:?}",
        started.elapsed()
    );
    assert_eq!(stats.packets, 0);
    assert!(!sink.state.lock().opened);
    assert!(sink.removed());
}
