//! Marker-delimited frame extraction
//!
//! The sniffer firmware wraps every frame in `40 53` ("@S") and `40 45`
//! ("@E"). The extractor turns an unbounded byte stream into those frames,
//! discarding noise and resynchronizing on the next start marker.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

/// Frame start marker
pub const START_MARKER: [u8; 2] = [0x40, 0x53];
/// Frame end marker
pub const END_MARKER: [u8; 2] = [0x40, 0x45];
/// Default upper bound for a pending frame
pub const MAX_FRAME_LEN: usize = 4096;

/// A candidate frame, markers included, bytes exactly as received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    raw: Bytes,
}

impl Frame {
    /// Wrap raw bytes that already carry both markers
    pub fn new(raw: Bytes) -> Self {
        Self { raw }
    }

    /// Full frame, markers included
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Both markers present
    pub fn is_valid(&self) -> bool {
        self.raw.len() >= START_MARKER.len() + END_MARKER.len()
            && self.raw.starts_with(&START_MARKER)
            && self.raw.ends_with(&END_MARKER)
    }
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Pull the next complete frame out of `buf`.
///
/// Returns the frame (if any) and how many bytes were thrown away while
/// searching for it.
fn extract(buf: &mut BytesMut, max_frame_len: usize) -> (Option<Frame>, usize) {
    let mut discarded = 0;

    loop {
        let Some(start) = find(buf, &START_MARKER, 0) else {
            // Keep a trailing 0x40 that may be the first half of a marker.
            let keep = usize::from(buf.last() == Some(&START_MARKER[0]));
            let drop = buf.len() - keep;
            buf.advance(drop);
            return (None, discarded + drop);
        };

        if start > 0 {
            buf.advance(start);
            discarded += start;
        }

        let end = find(buf, &END_MARKER, START_MARKER.len());
        let restart = find(buf, &START_MARKER, START_MARKER.len());

        match (end, restart) {
            (end, Some(next)) if end.map_or(true, |e| next < e) => {
                debug!(skipped = next, "start marker before end marker, resynchronizing");
                buf.advance(next);
                discarded += next;
            }
            (Some(e), _) => {
                let frame = buf.split_to(e + END_MARKER.len()).freeze();
                return (Some(Frame::new(frame)), discarded);
            }
            (None, _) => {
                if buf.len() > max_frame_len {
                    warn!(len = buf.len(), "frame exceeds maximum length, discarding");
                    buf.advance(START_MARKER.len());
                    discarded += START_MARKER.len();
                    continue;
                }
                return (None, discarded);
            }
        }
    }
}

/// Streaming marker frame extractor
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: BytesMut,
    max_frame_len: usize,
    discarded: u64,
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExtractor {
    /// Create an extractor with the default frame bound
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    /// Create an extractor with a custom frame bound
    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_len),
            max_frame_len,
            discarded: 0,
        }
    }

    /// Append received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Next complete frame, or `None` until more bytes arrive
    pub fn next_frame(&mut self) -> Option<Frame> {
        let (frame, discarded) = extract(&mut self.buffer, self.max_frame_len);
        self.discarded += discarded as u64;
        frame
    }

    /// Bytes waiting for an end marker
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total noise bytes dropped so far
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Drop any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Decoder for FrameExtractor {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (frame, discarded) = extract(src, self.max_frame_len);
        self.discarded += discarded as u64;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    const FRAME: &[u8] = &[0x40, 0x53, 0x01, 0x02, 0x00, 0xAA, 0xBB, 0x03, 0x40, 0x45];

    #[test]
    fn test_single_frame() {
        let mut ex = FrameExtractor::new();
        ex.push(FRAME);
        let frame = ex.next_frame().unwrap();
        assert_eq!(frame.as_bytes(), FRAME);
        assert!(frame.is_valid());
        assert!(ex.next_frame().is_none());
        assert_eq!(ex.buffered(), 0);
    }

    #[test]
    fn test_no_end_marker_yet() {
        let mut ex = FrameExtractor::new();
        ex.push(&FRAME[..6]);
        assert!(ex.next_frame().is_none());
        ex.push(&FRAME[6..]);
        assert_eq!(ex.next_frame().unwrap().as_bytes(), FRAME);
    }

    #[test]
    fn test_split_marker_across_chunks() {
        let mut ex = FrameExtractor::new();
        ex.push(&[0xFF, 0xEE, 0x40]);
        assert!(ex.next_frame().is_none());
        assert_eq!(ex.buffered(), 1);
        ex.push(&FRAME[1..]);
        assert_eq!(ex.next_frame().unwrap().as_bytes(), FRAME);
        assert_eq!(ex.discarded(), 2);
    }

    #[test]
    fn test_leading_noise_discarded() {
        let mut ex = FrameExtractor::new();
        ex.push(b"garbage");
        ex.push(FRAME);
        assert_eq!(ex.next_frame().unwrap().as_bytes(), FRAME);
        assert_eq!(ex.discarded(), 7);
    }

    #[test]
    fn test_resync_on_second_start() {
        let mut ex = FrameExtractor::new();
        ex.push(&[0x40, 0x53, 0xC0, 0x05]);
        ex.push(FRAME);
        let frame = ex.next_frame().unwrap();
        assert_eq!(frame.as_bytes(), FRAME);
        assert_eq!(ex.discarded(), 4);
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut ex = FrameExtractor::new();
        let mut stream = FRAME.to_vec();
        stream.extend_from_slice(FRAME);
        ex.push(&stream);
        assert!(ex.next_frame().is_some());
        assert!(ex.next_frame().is_some());
        assert!(ex.next_frame().is_none());
    }

    #[test]
    fn test_oversized_pending_frame_dropped() {
        let mut ex = FrameExtractor::with_max_frame_len(16);
        ex.push(&START_MARKER);
        ex.push(&[0u8; 32]);
        assert!(ex.next_frame().is_none());
        assert_eq!(ex.buffered(), 0);
        ex.push(FRAME);
        assert_eq!(ex.next_frame().unwrap().as_bytes(), FRAME);
    }

    #[test]
    fn test_concatenated_frames_reserialize() {
        let mut ex = FrameExtractor::new();
        let mut stream = b"\x00\x01".to_vec();
        for _ in 0..3 {
            stream.extend_from_slice(FRAME);
        }
        ex.push(&stream);
        let mut out = Vec::new();
        while let Some(frame) = ex.next_frame() {
            out.extend_from_slice(frame.as_bytes());
        }
        assert_eq!(out, &stream[2..]);
    }

    #[tokio::test]
    async fn test_decoder_over_async_reader() {
        let reader = tokio_test::io::Builder::new()
            .read(&FRAME[..4])
            .read(&FRAME[4..])
            .read(FRAME)
            .build();
        let mut frames = FramedRead::new(reader, FrameExtractor::new());
        assert_eq!(frames.next().await.unwrap().unwrap().as_bytes(), FRAME);
        assert_eq!(frames.next().await.unwrap().unwrap().as_bytes(), FRAME);
        assert!(frames.next().await.is_none());
    }
}
