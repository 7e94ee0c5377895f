//! PCAP encoding
//!
//! Classic libpcap stream: one 24 byte global header, then per packet a
//! 16 byte record header and a synthetic radio-info header + payload. The
//! framed family uses the TI radio packet info layout (USER0), LoRa uses
//! the CatSniffer LoRa layout (USER1).

use crate::core::context::CaptureContext;
use crate::core::packet::{Packet, Signal};
use crate::core::protocol::DeviceFamily;
use crate::core::sink::{PipeSink, SinkError};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tracing::debug;

/// libpcap magic, microsecond timestamps
pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
/// Snapshot length
pub const SNAPLEN: u32 = 0xFFFF;
/// LINKTYPE_USER0, TI radio packet info
pub const LINKTYPE_TI_RPI: u32 = 147;
/// LINKTYPE_USER1, CatSniffer LoRa
pub const LINKTYPE_LORA: u32 = 148;
/// Global header size
pub const GLOBAL_HEADER_LEN: usize = 24;
/// Record header size
pub const RECORD_HEADER_LEN: usize = 16;

const INTERFACE_ID: u16 = 3;
const LORA_PROTOCOL: u8 = 0x05;
const LORA_PHY: u8 = 0x06;

/// Link type for a device family
pub fn link_type(family: DeviceFamily) -> u32 {
    match family {
        DeviceFamily::Framed => LINKTYPE_TI_RPI,
        DeviceFamily::AsciiLora => LINKTYPE_LORA,
    }
}

/// Packet to capture record encoder
#[derive(Debug, Clone, Copy)]
pub struct PcapEncoder {
    family: DeviceFamily,
}

impl PcapEncoder {
    /// Encoder for a device family
    pub fn new(family: DeviceFamily) -> Self {
        Self { family }
    }

    /// Link type written in the global header
    pub fn link_type(&self) -> u32 {
        link_type(self.family)
    }

    /// 24 byte global header
    pub fn global_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(GLOBAL_HEADER_LEN);
        buf.put_u32_le(PCAP_MAGIC);
        buf.put_u16_le(2);
        buf.put_u16_le(4);
        buf.put_i32_le(0);
        buf.put_u32_le(0);
        buf.put_u32_le(SNAPLEN);
        buf.put_u32_le(self.link_type());
        buf.freeze()
    }

    /// Record header + radio-info header + payload
    pub fn record(&self, packet: &Packet, context: &CaptureContext, at: DateTime<Utc>) -> Bytes {
        let body = match self.family {
            DeviceFamily::Framed => framed_body(packet, context),
            DeviceFamily::AsciiLora => lora_body(packet, context),
        };
        let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
        let secs = u32::try_from(at.timestamp()).unwrap_or_default();

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_LEN + body.len());
        buf.put_u32_le(secs);
        buf.put_u32_le(at.timestamp_subsec_micros());
        buf.put_u32_le(len);
        buf.put_u32_le(len);
        buf.put_slice(&body);
        buf.freeze()
    }
}

fn framed_body(packet: &Packet, context: &CaptureContext) -> BytesMut {
    let settings = &context.framed;
    let mut buf = BytesMut::with_capacity(18 + packet.payload.len());
    buf.put_u8(0);
    buf.put_u16_le(packet.declared_len);
    buf.put_u8(0);
    buf.put_u16_le(INTERFACE_ID);
    buf.put_u8(settings.phy.capture_protocol());
    buf.put_u8(settings.phy.capture_phy());
    buf.put_u32_le(settings.frequency_khz());
    buf.put_u16_le(settings.channel);
    buf.put_i8(packet.rssi.map_or(0, Signal::as_i8));
    buf.put_u8(packet.status.unwrap_or(0));
    buf.put_bytes(0, 2);
    buf.put_slice(&packet.payload);
    buf
}

fn lora_body(packet: &Packet, context: &CaptureContext) -> BytesMut {
    let settings = &context.lora;
    let mut buf = BytesMut::with_capacity(22 + packet.payload.len());
    buf.put_u8(0);
    buf.put_u16_le(u16::try_from(packet.payload.len()).unwrap_or(u16::MAX));
    buf.put_u16_le(INTERFACE_ID);
    buf.put_u8(LORA_PROTOCOL);
    buf.put_u8(LORA_PHY);
    buf.put_u32_le(settings.frequency_hz / 1_000_000);
    buf.put_u8(settings.bandwidth_code());
    buf.put_u8(settings.spreading_factor);
    buf.put_u8(settings.coding_rate);
    buf.put_f32_le(packet.rssi.map_or(0.0, Signal::as_f32));
    buf.put_f32_le(packet.snr.map_or(0.0, Signal::as_f32));
    buf.put_slice(&packet.payload);
    buf
}

/// Capture stream over a pipe sink.
///
/// Emits the global header exactly once, ahead of the first record.
pub struct CaptureWriter {
    sink: Box<dyn PipeSink>,
    encoder: PcapEncoder,
    header_written: bool,
    records: u64,
}

impl CaptureWriter {
    /// Writer over an opened (or soon to be opened) sink
    pub fn new(sink: Box<dyn PipeSink>, family: DeviceFamily) -> Self {
        Self {
            sink,
            encoder: PcapEncoder::new(family),
            header_written: false,
            records: 0,
        }
    }

    /// Write the global header if it has not gone out yet
    pub async fn ensure_header(&mut self) -> Result<(), SinkError> {
        if !self.header_written {
            self.sink.write(&self.encoder.global_header()).await?;
            self.header_written = true;
            debug!(link_type = self.encoder.link_type(), "pcap header written");
        }
        Ok(())
    }

    /// Encode and write one packet
    pub async fn write_packet(&mut self, packet: &Packet, context: &CaptureContext) -> Result<(), SinkError> {
        self.ensure_header().await?;
        let record = self.encoder.record(packet, context, Utc::now());
        self.sink.write(&record).await?;
        self.records += 1;
        Ok(())
    }

    /// Records written so far
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Underlying sink
    pub fn sink_mut(&mut self) -> &mut dyn PipeSink {
        self.sink.as_mut()
    }
}
