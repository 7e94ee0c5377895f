//! Core module containing the capture pipeline
//!
//! This module provides:
//! - Transport layer for serial endpoints (plus an in-memory pair)
//! - Device protocols: frame extraction and dissection
//! - Capture file encoding and pipe sinks
//! - Command/response correlation per endpoint
//! - Toolbar control channel codec
//! - Logging setup
//! - Capture session lifecycle

pub mod context;
pub mod control;
pub mod endpoint;
pub mod logger;
pub mod packet;
pub mod pcap;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transport;
