//! Byte-by-byte frame recovery from an arbitrary stream.
//!
//! The parser is a four-state machine (search / preamble / header / payload)
//! that buffers bytes from the first sync byte onward and emits a frame once
//! the buffered packet is complete. Corrupt input resyncs silently: garbage
//! between frames, broken preambles and truncated packets are all discarded
//! without an error. Only a frame whose header verified but whose payload did
//! not is reported, as a partially-populated frame with a `PayloadCorrupt`
//! status.

use crate::network::frame::{
    payload_size_field, wire_checksum, Frame, HEADER_SIZE, SYNC_BYTE, SYNC_BYTE_COUNT,
};
use crate::AppError;
use crate::MessageStatus;

// Buffer capacity retained across frames; larger payload allocations are
// released on reset.
const RETAINED_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Search,
    Preamble,
    Header,
    Payload,
}

/// A frame recovered from the stream.
///
/// `error` is set when the payload checksum or base64 text failed to verify;
/// the frame then carries the header fields with an empty payload and status
/// `PayloadCorrupt`. Cleanly parsed frames are emitted with status `Received`
/// regardless of the status byte on the wire: the emitted status is the local
/// parse outcome, while the wire status survives in `wire_status` for
/// timestamp attribution.
#[derive(Debug)]
pub struct ParsedFrame {
    pub frame: Frame,
    pub wire_status: MessageStatus,
    pub error: Option<AppError>,
}

#[derive(Debug)]
pub struct FrameParser {
    state: ParserState,
    buf: Vec<u8>,
    pos: usize,
    // index of the payload checksum byte, valid in the payload state
    payload_checksum_index: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            state: ParserState::Search,
            buf: vec![0u8; HEADER_SIZE],
            pos: 0,
            payload_checksum_index: 0,
        }
    }

    /// Consumes one byte, returning a frame when it completes a packet.
    pub fn push_byte(&mut self, b: u8) -> Option<ParsedFrame> {
        match self.state {
            ParserState::Search => {
                if b == SYNC_BYTE {
                    self.buf[0] = b;
                    self.pos = 1;
                    self.state = ParserState::Preamble;
                }
                None
            }
            ParserState::Preamble => {
                if b != SYNC_BYTE {
                    self.reset();
                    return None;
                }
                self.buf[self.pos] = b;
                self.pos += 1;
                if self.pos == SYNC_BYTE_COUNT {
                    self.state = ParserState::Header;
                }
                None
            }
            ParserState::Header => {
                self.buf[self.pos] = b;
                self.pos += 1;
                if self.pos < HEADER_SIZE {
                    return None;
                }

                if self.buf[HEADER_SIZE - 1]
                    != wire_checksum(&self.buf[SYNC_BYTE_COUNT..HEADER_SIZE - 1])
                {
                    // A later frame's preamble may have begun inside the bytes
                    // consumed as this header; replay everything past the
                    // first sync byte so it is not lost.
                    self.rescan();
                    return None;
                }

                let payload_size = payload_size_field(&self.buf);
                if payload_size == 0 {
                    return self.complete(HEADER_SIZE);
                }

                self.payload_checksum_index = HEADER_SIZE + payload_size;
                self.buf.resize(self.payload_checksum_index + 1, 0);
                self.state = ParserState::Payload;
                None
            }
            ParserState::Payload => {
                self.buf[self.pos] = b;
                if self.pos == self.payload_checksum_index {
                    return self.complete(self.pos + 1);
                }
                self.pos += 1;
                None
            }
        }
    }

    fn complete(&mut self, size: usize) -> Option<ParsedFrame> {
        let parsed = match Frame::decode(&self.buf[..size]) {
            Ok(frame) => {
                let wire_status = frame.status;
                Some(ParsedFrame {
                    frame: Frame {
                        status: MessageStatus::Received,
                        ..frame
                    },
                    wire_status,
                    error: None,
                })
            }
            Err(AppError::InvalidMessagePayload) => {
                Frame::decode_header(&self.buf[..HEADER_SIZE])
                    .ok()
                    .map(|frame| {
                        let wire_status = frame.status;
                        ParsedFrame {
                            frame: Frame {
                                status: MessageStatus::PayloadCorrupt,
                                ..frame
                            },
                            wire_status,
                            error: Some(AppError::InvalidMessagePayload),
                        }
                    })
            }
            // header verified but a fixed field (e.g. the status byte) did
            // not parse; nothing usable to surface
            Err(_) => None,
        };
        self.reset();
        parsed
    }

    // Drops the leading sync byte of a failed header and re-feeds the rest.
    // The replay is at most 30 bytes, which can never complete a packet, so
    // this cannot recurse past one level.
    fn rescan(&mut self) {
        let stash: Vec<u8> = self.buf[1..HEADER_SIZE].to_vec();
        self.reset();
        for b in stash {
            self.push_byte(b);
        }
    }

    fn reset(&mut self) {
        self.state = ParserState::Search;
        self.pos = 0;
        self.buf.truncate(HEADER_SIZE);
        if self.buf.capacity() > RETAINED_BUFFER_SIZE {
            self.buf.shrink_to(RETAINED_BUFFER_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    // Fixed ids keep every byte of the test streams deterministic.
    fn sent_frame(id: u32, payload: Option<&[u8]>) -> Frame {
        Frame {
            id,
            status: MessageStatus::Sent,
            reply_port: 9001,
            timestamp_ms: 1_700_000_000_123,
            payload: payload.map(Bytes::copy_from_slice),
        }
    }

    fn feed(parser: &mut FrameParser, bytes: &[u8]) -> Vec<ParsedFrame> {
        let mut out = Vec::new();
        for &b in bytes {
            if let Some(parsed) = parser.push_byte(b) {
                out.push(parsed);
            }
        }
        out
    }

    #[test]
    fn test_single_frame() {
        let frame = sent_frame(1, Some(b"hello"));
        let mut parser = FrameParser::new();

        let parsed = feed(&mut parser, &frame.encode());
        assert_eq!(parsed.len(), 1);
        assert!(parsed[0].error.is_none());
        assert_eq!(parsed[0].wire_status, MessageStatus::Sent);
        assert_eq!(parsed[0].frame.status, MessageStatus::Received);
        assert_eq!(parsed[0].frame.id, frame.id);
        assert_eq!(parsed[0].frame.payload.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_garbage_prefix_is_skipped() {
        let frame = sent_frame(2, Some(&[1, 2, 3]));
        let mut stream = vec![0xAAu8; 40];
        // a partial sync run must not confuse the search
        stream.extend_from_slice(&[SYNC_BYTE; 5]);
        stream.push(0x00);
        stream.extend_from_slice(&frame.encode());

        let parsed = feed(&mut FrameParser::new(), &stream);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].frame.id, frame.id);
        assert!(parsed[0].error.is_none());
    }

    #[test]
    fn test_back_to_back_frames() {
        let first = sent_frame(3, Some(b"first"));
        let second = sent_frame(4, None);
        let mut stream = first.encode().to_vec();
        stream.extend_from_slice(&second.encode());

        let parsed = feed(&mut FrameParser::new(), &stream);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].frame.id, first.id);
        assert_eq!(parsed[1].frame.id, second.id);
        assert!(parsed[1].frame.payload.is_none());
    }

    #[test]
    fn test_truncated_frame_then_complete_frame() {
        let first = sent_frame(7, Some(b"truncated away"));
        let second = sent_frame(8, Some(b"survivor"));
        let mut stream = first.encode()[..20].to_vec();
        stream.extend_from_slice(&second.encode());

        let parsed = feed(&mut FrameParser::new(), &stream);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].frame.id, second.id);
        assert_eq!(parsed[0].frame.payload.as_deref(), Some(&b"survivor"[..]));
        assert!(parsed[0].error.is_none());
    }

    #[test]
    fn test_corrupt_payload_is_surfaced_and_stream_recovers() {
        let corrupt = sent_frame(5, Some(b"to be corrupted"));
        let clean = sent_frame(6, Some(b"clean"));

        let mut stream = corrupt.encode().to_vec();
        // flip one payload byte; the header stays intact
        stream[HEADER_SIZE] ^= 0x01;
        stream.extend_from_slice(&clean.encode());

        let parsed = feed(&mut FrameParser::new(), &stream);
        assert_eq!(parsed.len(), 2);

        assert_eq!(parsed[0].frame.id, corrupt.id);
        assert_eq!(parsed[0].frame.status, MessageStatus::PayloadCorrupt);
        assert!(parsed[0].frame.payload.is_none());
        assert!(matches!(
            parsed[0].error,
            Some(AppError::InvalidMessagePayload)
        ));

        assert_eq!(parsed[1].frame.id, clean.id);
        assert!(parsed[1].error.is_none());
    }

    #[test]
    fn test_header_corruption_resyncs_silently() {
        let broken = sent_frame(9, None);
        let clean = sent_frame(10, None);

        let mut stream = broken.encode().to_vec();
        stream[9] ^= 0xFF;
        stream.extend_from_slice(&clean.encode());

        let parsed = feed(&mut FrameParser::new(), &stream);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].frame.id, clean.id);
    }

    #[test]
    fn test_chunked_delivery() {
        let frame = sent_frame(11, Some(&[9u8; 100]));
        let encoded = frame.encode();

        let mut parser = FrameParser::new();
        let mut parsed = Vec::new();
        for chunk in encoded.chunks(7) {
            parsed.extend(feed(&mut parser, chunk));
        }
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].frame, Frame {
            status: MessageStatus::Received,
            ..frame
        });
    }

    #[test]
    fn test_large_payload() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(256 * 1024).collect();
        let frame = sent_frame(12, Some(&payload));

        let parsed = feed(&mut FrameParser::new(), &frame.encode());
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].frame.payload.as_deref(), Some(&payload[..]));
    }
}
