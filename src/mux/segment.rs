//! Segment format and incremental parsing.
//!
//! A segment is the unit the physical socket carries: a 5-byte header
//! followed by the payload bytes of exactly one logical-channel frame.
//!
//! ```text
//! ┌──────────┬───────────┬─────────────┐
//! │ Channel  │ Length    │ Payload     │
//! │ 1 byte   │ 4 bytes   │ N bytes     │
//! │          │ uint32 BE │             │
//! └──────────┴───────────┴─────────────┘
//! ```
//!
//! The demultiplexor routes each whole segment to the queue of the channel
//! named in its header, which is what keeps bytes of channel *i* out of
//! channel *j*'s stream.

use bytes::{Bytes, BytesMut};

use crate::error::{MqwireError, Result};

/// Segment header size in bytes (fixed, exactly 5).
pub const SEGMENT_HEADER_SIZE: usize = 5;

/// Default maximum segment payload size (16 MB). A single frame carries one
/// request, reply, or pushed message; anything larger is a corrupt stream.
pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 16 * 1024 * 1024;

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Logical channel this segment belongs to.
    pub channel: u8,
    /// Payload length in bytes.
    pub length: u32,
}

impl SegmentHeader {
    /// Create a new header.
    pub fn new(channel: u8, length: u32) -> Self {
        Self { channel, length }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf[0] = self.channel;
        buf[1..5].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode header from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            channel: buf[0],
            length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }
}

/// A complete segment: header plus payload.
#[derive(Debug, Clone)]
pub struct Segment {
    pub channel: u8,
    pub payload: Bytes,
}

/// State machine for segment parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header (need 5 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: SegmentHeader },
}

/// Buffer accumulating socket reads and extracting complete segments.
///
/// Data is kept in a single `BytesMut`; payloads are split off and frozen
/// without copying.
pub struct SegmentBuffer {
    buffer: BytesMut,
    state: State,
    max_segment_size: u32,
}

impl SegmentBuffer {
    /// Create a segment buffer with default limits.
    pub fn new() -> Self {
        Self::with_max_segment(DEFAULT_MAX_SEGMENT_SIZE)
    }

    /// Create a segment buffer with a custom payload-size limit.
    pub fn with_max_segment(max_segment_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_segment_size,
        }
    }

    /// Push data into the buffer and extract all complete segments.
    ///
    /// Partial data is retained internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a header claims a payload above the
    /// configured maximum. The stream is unrecoverable at that point.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Segment>> {
        self.buffer.extend_from_slice(data);

        let mut segments = Vec::new();
        while let Some(segment) = self.try_extract_one()? {
            segments.push(segment);
        }
        Ok(segments)
    }

    fn try_extract_one(&mut self) -> Result<Option<Segment>> {
        match &self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < SEGMENT_HEADER_SIZE {
                    return Ok(None);
                }

                let header = SegmentHeader::decode(&self.buffer[..SEGMENT_HEADER_SIZE])
                    .expect("buffer has enough bytes");

                if header.length > self.max_segment_size {
                    return Err(MqwireError::Protocol(format!(
                        "segment payload {} exceeds maximum {}",
                        header.length, self.max_segment_size
                    )));
                }

                let _ = self.buffer.split_to(SEGMENT_HEADER_SIZE);

                if header.length == 0 {
                    return Ok(Some(Segment {
                        channel: header.channel,
                        payload: Bytes::new(),
                    }));
                }

                self.state = State::WaitingForPayload { header };
                self.try_extract_one()
            }

            State::WaitingForPayload { header } => {
                let needed = header.length as usize;
                if self.buffer.len() < needed {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(needed).freeze();
                let channel = header.channel;
                self.state = State::WaitingForHeader;

                Ok(Some(Segment { channel, payload }))
            }
        }
    }

    /// Number of buffered bytes not yet parsed into a segment.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a complete segment as a single byte vector (test/helper path; the
/// writer task uses vectored I/O instead).
pub fn build_segment(channel: u8, payload: &[u8]) -> Vec<u8> {
    let header = SegmentHeader::new(channel, payload.len() as u32);
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = SegmentHeader::new(2, 0x01020304);
        let encoded = original.encode();
        assert_eq!(encoded[0], 2);
        assert_eq!(&encoded[1..5], &[0x01, 0x02, 0x03, 0x04]);
        let decoded = SegmentHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_too_short() {
        assert!(SegmentHeader::decode(&[1, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_single_complete_segment() {
        let mut buffer = SegmentBuffer::new();
        let segments = buffer.push(&build_segment(1, b"hello")).unwrap();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].channel, 1);
        assert_eq!(&segments[0].payload[..], b"hello");
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_interleaved_channels_in_one_push() {
        let mut buffer = SegmentBuffer::new();
        let mut data = build_segment(1, b"sync");
        data.extend_from_slice(&build_segment(2, b"push"));
        data.extend_from_slice(&build_segment(1, b"sync2"));

        let segments = buffer.push(&data).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].channel, 1);
        assert_eq!(segments[1].channel, 2);
        assert_eq!(&segments[1].payload[..], b"push");
        assert_eq!(segments[2].channel, 1);
    }

    #[test]
    fn test_fragmented_delivery() {
        let mut buffer = SegmentBuffer::new();
        let bytes = build_segment(2, b"fragmented payload");

        // Byte at a time, worst case.
        let mut collected = Vec::new();
        for byte in &bytes {
            collected.extend(buffer.push(&[*byte]).unwrap());
        }

        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].channel, 2);
        assert_eq!(&collected[0].payload[..], b"fragmented payload");
    }

    #[test]
    fn test_empty_payload_segment() {
        let mut buffer = SegmentBuffer::new();
        let segments = buffer.push(&build_segment(1, b"")).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].payload.is_empty());
    }

    #[test]
    fn test_oversize_segment_rejected() {
        let mut buffer = SegmentBuffer::with_max_segment(16);
        let header = SegmentHeader::new(1, 1000).encode();
        let result = buffer.push(&header);
        assert!(matches!(result, Err(MqwireError::Protocol(_))));
    }

    #[test]
    fn test_partial_then_complete() {
        let mut buffer = SegmentBuffer::new();
        let bytes = build_segment(1, b"split me");

        let cut = SEGMENT_HEADER_SIZE + 3;
        assert!(buffer.push(&bytes[..cut]).unwrap().is_empty());
        let segments = buffer.push(&bytes[cut..]).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(&segments[0].payload[..], b"split me");
    }
}
