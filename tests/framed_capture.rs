//! Framed sniffer capture sessions against a simulated board

mod common;

use catbridge_core::core::context::CaptureContext;
use catbridge_core::core::protocol::DeviceFamily;
use catbridge_core::core::session::{CaptureSession, DeviceLink, SessionConfig, SessionError};
use catbridge_core::core::sink::SinkError;
use catbridge_core::core::transport::MemoryTransport;
use catbridge_core::ExitCodes;
use common::{eventually, spawn_framed_firmware, MemorySink, WAIT};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HEADER_LEN: usize = 24;
const FRAMED_RECORD_LEN: usize = 16 + 18 + 5;

fn session(sink: &MemorySink, bridge: MemoryTransport) -> CaptureSession {
    let mut config = SessionConfig::new(CaptureContext::new(DeviceFamily::Framed));
    config.command_pacing = Duration::from_millis(10);
    config.read_timeout = Duration::from_millis(20);
    config.stop_timeout = Duration::from_millis(100);
    CaptureSession::new(config, DeviceLink::Framed { bridge: Box::new(bridge) }, sink.boxed())
}

#[tokio::test]
async fn test_startup_sequence_and_record() {
    let (host, device) = MemoryTransport::pair();
    let (codes, firmware) = spawn_framed_firmware(device);
    let sink = MemorySink::default();
    let cancel = CancellationToken::new();
    let running = tokio::spawn(session(&sink, host).run(cancel.clone()));

    eventually("first record", || sink.len() >= HEADER_LEN + FRAMED_RECORD_LEN).await;
    cancel.cancel();
    let stats = tokio::time::timeout(WAIT, running).await.unwrap().unwrap().unwrap();
    assert_eq!(stats.packets, 1);
    assert_eq!(stats.non_data, 1);
    assert_eq!(stats.discarded, 0);

    // PING, STOP, CFG_PHY, CFG_FREQUENCY, START, then STOP at teardown
    eventually("stop command", || codes.lock().len() == 6).await;
    assert_eq!(*codes.lock(), vec![0x40, 0x42, 0x47, 0x45, 0x41, 0x42]);

    let bytes = sink.bytes();
    assert_eq!(bytes.len(), HEADER_LEN + FRAMED_RECORD_LEN);
    assert_eq!(u32::from_le_bytes(bytes[20..24].try_into().unwrap()), 147);

    let record = &bytes[HEADER_LEN..];
    assert_eq!(u32::from_le_bytes(record[8..12].try_into().unwrap()), 23);
    let body = &record[16..];
    assert_eq!(u16::from_le_bytes([body[1], body[2]]), 7);
    assert_eq!(u16::from_le_bytes([body[4], body[5]]), 3);
    assert_eq!(&body[6..8], &[0x02, 0x03]);
    assert_eq!(u32::from_le_bytes(body[8..12].try_into().unwrap()), 2_405_000);
    assert_eq!(u16::from_le_bytes([body[12], body[13]]), 11);
    assert_eq!(body[14] as i8, -40);
    assert_eq!(body[15], 0x80);
    assert_eq!(&body[18..], &[0xAA, 0xBB, 0xCC, 0xDD, 0xEE]);
    assert!(sink.removed());
    firmware.abort();
}

#[tokio::test]
async fn test_reader_gone_ends_session() {
    let (host, device) = MemoryTransport::pair();
    let (codes, firmware) = spawn_framed_firmware(device);
    let sink = MemorySink::default();
    sink.close_reader();

    let err = tokio::time::timeout(WAIT, session(&sink, host).run(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::Sink(SinkError::ReaderGone)));
    assert_eq!(err.exit_code(), ExitCodes::PIPE_ERROR);
    assert!(sink.removed());
    eventually("stop command", || codes.lock().last() == Some(&0x42)).await;
    firmware.abort();
}

#[tokio::test]
async fn test_bad_channel_is_rejected_before_streaming() {
    let (host, device) = MemoryTransport::pair();
    let (codes, firmware) = spawn_framed_firmware(device);
    let sink = MemorySink::default();

    let mut config = SessionConfig::new(CaptureContext::new(DeviceFamily::Framed));
    config.context.framed.channel = 40;
    config.stop_timeout = Duration::from_millis(100);
    let session = CaptureSession::new(config, DeviceLink::Framed { bridge: Box::new(host) }, sink.boxed());

    let err = tokio::time::timeout(WAIT, session.run(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, SessionError::Setting(_)));
    assert_eq!(err.exit_code(), ExitCodes::CONFIG_ERROR);
    assert!(!codes.lock().contains(&0x41));
    assert!(sink.bytes().is_empty());
    firmware.abort();
}
