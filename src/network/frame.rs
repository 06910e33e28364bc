//! Wire packet layout:
//!
//! ```text
//! |<----------------------HEADER------------------------>|<----------PAYLOAD----------->|
//! | 0 : 5 | 6 : 7 | 8  | 9 : 12 | 13 : 25 | 26 : 29 | 30 | 31 : {30+PAYSZ} | {31+PAYSZ} |
//! | SYNC  | REPLY | ST |   ID   |TIMESTAMP|  PAYSZ  | HC |     PAYLOAD     |     PC     |
//! ```
//!
//! SYNC is the byte 22 repeated six times. REPLY is the originator's listening
//! port (big-endian u16). ST is the message status. ID is a big-endian u32.
//! TIMESTAMP is the unix-epoch milliseconds as exactly 13 zero-padded ASCII
//! digits. PAYSZ is the big-endian u32 length of the base64 payload text. HC is
//! the header checksum over bytes 6..=29. PAYLOAD is standard base64 and PC is
//! its checksum; both are absent when PAYSZ is zero (receipts are header-only).
//!
//! The timestamp travels as text and the payload as base64 so that the sync
//! sequence can never occur past byte 5 of a well-formed packet, which makes
//! the preamble a sufficient resync signal for the streaming parser.

use std::sync::atomic::{AtomicU32, Ordering};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};

use crate::AppError;
use crate::AppResult;

pub(crate) const HEADER_SIZE: usize = 31;
pub(crate) const SYNC_BYTE: u8 = 22;
pub(crate) const SYNC_BYTE_COUNT: usize = 6;

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocates a fresh frame id from the process-wide monotonic counter.
pub(crate) fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Delivery status carried in byte 8 of every frame.
///
/// `Sent` frames are produced by the originator; `Received` and
/// `PayloadCorrupt` are receipt statuses produced by the recipient.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sent = 100,
    Received = 200,
    PayloadCorrupt = 201,
}

impl TryFrom<u8> for MessageStatus {
    type Error = AppError;

    fn try_from(value: u8) -> AppResult<Self> {
        match value {
            100 => Ok(MessageStatus::Sent),
            200 => Ok(MessageStatus::Received),
            201 => Ok(MessageStatus::PayloadCorrupt),
            _ => Err(AppError::InvalidMessageFormat),
        }
    }
}

/// One self-delimited packet on the wire.
///
/// `payload` holds the application-encoded bytes; the base64 wrapping only
/// exists inside `encode`/`decode`. The codec round-trips every field
/// verbatim, including `status`: normalizing a received frame's status to
/// the local parse outcome is the parser's job, not the codec's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub status: MessageStatus,
    pub reply_port: u16,
    pub timestamp_ms: i64,
    pub payload: Option<Bytes>,
}

impl Frame {
    /// Builds an originator frame with a fresh id, stamped now.
    pub fn new_sent(reply_port: u16, timestamp_ms: i64, payload: Option<Bytes>) -> Frame {
        Frame {
            id: next_message_id(),
            status: MessageStatus::Sent,
            reply_port,
            timestamp_ms,
            payload,
        }
    }

    /// Builds a receipt for the frame with the given id. Receipts carry no
    /// payload and echo the recipient's parse outcome as their status.
    pub fn new_receipt(id: u32, reply_port: u16, status: MessageStatus, timestamp_ms: i64) -> Frame {
        Frame {
            id,
            status,
            reply_port,
            timestamp_ms,
            payload: None,
        }
    }

    /// Serializes the frame. The result is exactly 31 bytes for a payload-less
    /// frame and `31 + N + 1` bytes for a payload of N base64 characters.
    pub fn encode(&self) -> Bytes {
        let payload_b64 = self
            .payload
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| BASE64.encode(p));
        let payload_size = payload_b64.as_ref().map_or(0, |p| p.len());

        let total = if payload_size > 0 {
            HEADER_SIZE + payload_size + 1
        } else {
            HEADER_SIZE
        };
        let mut buf = BytesMut::with_capacity(total);

        buf.put_bytes(SYNC_BYTE, SYNC_BYTE_COUNT);
        buf.put_u16(self.reply_port);
        buf.put_u8(self.status as u8);
        buf.put_u32(self.id);
        buf.put_slice(format!("{:013}", self.timestamp_ms).as_bytes());
        buf.put_u32(payload_size as u32);
        buf.put_u8(wire_checksum(&buf[SYNC_BYTE_COUNT..HEADER_SIZE - 1]));

        if let Some(payload_b64) = payload_b64 {
            buf.put_slice(payload_b64.as_bytes());
            buf.put_u8(wire_checksum(payload_b64.as_bytes()));
        }

        buf.freeze()
    }

    /// Deserializes a complete frame.
    ///
    /// Fails with `InvalidMessageFormat` when the preamble, header checksum or
    /// any fixed field is broken, and with `InvalidMessagePayload` when the
    /// buffer length disagrees with the declared payload size or the payload
    /// checksum/base64 text does not verify.
    pub fn decode(bytes: &[u8]) -> AppResult<Frame> {
        let mut frame = Frame::decode_header(bytes)?;

        let payload_size = payload_size_field(bytes);
        if payload_size == 0 {
            return Ok(frame);
        }

        if bytes.len() != HEADER_SIZE + payload_size + 1 {
            return Err(AppError::InvalidMessagePayload);
        }

        let payload_b64 = &bytes[HEADER_SIZE..HEADER_SIZE + payload_size];
        if bytes[HEADER_SIZE + payload_size] != wire_checksum(payload_b64) {
            return Err(AppError::InvalidMessagePayload);
        }

        let payload = BASE64
            .decode(payload_b64)
            .map_err(|_| AppError::InvalidMessagePayload)?;
        frame.payload = Some(Bytes::from(payload));

        Ok(frame)
    }

    /// Deserializes just the fixed header, leaving `payload` empty. Used by
    /// the parser to surface a partially-populated frame when the payload is
    /// corrupt.
    pub(crate) fn decode_header(bytes: &[u8]) -> AppResult<Frame> {
        if bytes.len() < HEADER_SIZE {
            return Err(AppError::InvalidMessageFormat);
        }

        if bytes[..SYNC_BYTE_COUNT].iter().any(|b| *b != SYNC_BYTE) {
            return Err(AppError::InvalidMessageFormat);
        }

        if bytes[HEADER_SIZE - 1] != wire_checksum(&bytes[SYNC_BYTE_COUNT..HEADER_SIZE - 1]) {
            return Err(AppError::InvalidMessageFormat);
        }

        let reply_port = u16::from_be_bytes([bytes[6], bytes[7]]);
        let status = MessageStatus::try_from(bytes[8])?;
        let id = u32::from_be_bytes([bytes[9], bytes[10], bytes[11], bytes[12]]);

        let timestamp_ms = std::str::from_utf8(&bytes[13..26])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(AppError::InvalidMessageFormat)?;

        Ok(Frame {
            id,
            status,
            reply_port,
            timestamp_ms,
            payload: None,
        })
    }
}

/// Declared base64 payload length, bytes 26..=29 big-endian.
pub(crate) fn payload_size_field(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[26], bytes[27], bytes[28], bytes[29]]) as usize
}

/// Byte-sum checksum, complemented so an all-zero region never verifies.
pub(crate) fn wire_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) ^ 0xFF
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(payload: Option<&[u8]>) -> Frame {
        Frame {
            id: next_message_id(),
            status: MessageStatus::Sent,
            reply_port: 9001,
            timestamp_ms: 1_700_000_000_123,
            payload: payload.map(Bytes::copy_from_slice),
        }
    }

    #[test]
    fn test_roundtrip_no_payload() {
        let frame = sample_frame(None);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_raw_payload() {
        let frame = sample_frame(Some(&[1, 2, 3, 4]));
        let bytes = frame.encode();
        // 4 raw bytes base64-encode to 8 characters
        assert_eq!(bytes.len(), HEADER_SIZE + 8 + 1);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_roundtrip_receipt() {
        let frame = Frame::new_receipt(42, 9002, MessageStatus::Received, 1_700_000_000_456);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.status, MessageStatus::Received);
    }

    #[test]
    fn test_preamble_is_never_repeated_in_body() {
        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let bytes = sample_frame(Some(&payload)).encode();
        let sync = [SYNC_BYTE; SYNC_BYTE_COUNT];
        let occurrences = bytes
            .windows(SYNC_BYTE_COUNT)
            .filter(|w| *w == sync)
            .count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn test_header_bit_flips_rejected() {
        let bytes = sample_frame(Some(&[7, 7, 7])).encode();
        for index in SYNC_BYTE_COUNT..HEADER_SIZE {
            for bit in 0..8 {
                let mut corrupted = bytes.to_vec();
                corrupted[index] ^= 1 << bit;
                match Frame::decode(&corrupted) {
                    Err(AppError::InvalidMessageFormat) => {}
                    other => panic!(
                        "flip at byte {index} bit {bit} gave {other:?} instead of InvalidMessageFormat"
                    ),
                }
            }
        }
    }

    #[test]
    fn test_sync_bit_flips_rejected() {
        let bytes = sample_frame(None).encode();
        for index in 0..SYNC_BYTE_COUNT {
            let mut corrupted = bytes.to_vec();
            corrupted[index] ^= 0x01;
            assert!(matches!(
                Frame::decode(&corrupted),
                Err(AppError::InvalidMessageFormat)
            ));
        }
    }

    #[test]
    fn test_payload_bit_flips_rejected() {
        let bytes = sample_frame(Some(&[10, 20, 30, 40, 50])).encode();
        for index in HEADER_SIZE..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.to_vec();
                corrupted[index] ^= 1 << bit;
                match Frame::decode(&corrupted) {
                    Err(AppError::InvalidMessagePayload) => {}
                    other => panic!(
                        "flip at byte {index} bit {bit} gave {other:?} instead of InvalidMessagePayload"
                    ),
                }
            }
        }
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let bytes = sample_frame(Some(&[1, 2, 3, 4])).encode();
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 1]),
            Err(AppError::InvalidMessagePayload)
        ));
    }

    #[test]
    fn test_unknown_status_rejected() {
        let mut bytes = sample_frame(None).encode().to_vec();
        bytes[8] = 150;
        // fix the header checksum so only the status byte is at fault
        bytes[HEADER_SIZE - 1] = wire_checksum(&bytes[SYNC_BYTE_COUNT..HEADER_SIZE - 1]);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(AppError::InvalidMessageFormat)
        ));
    }

    #[test]
    fn test_timestamp_is_ascii_text() {
        let frame = sample_frame(None);
        let bytes = frame.encode();
        let text = std::str::from_utf8(&bytes[13..26]).unwrap();
        assert_eq!(text, "1700000000123");
    }

    #[test]
    fn test_message_ids_are_monotonic() {
        let a = next_message_id();
        let b = next_message_id();
        assert!(b > a);
    }
}
