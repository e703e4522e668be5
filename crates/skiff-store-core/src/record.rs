//! On-disk record codec.
//!
//! Every event is framed as a fixed header, the payload, and an aligned
//! trailer (all integers little-endian):
//!
//! ```text
//! +-----------+-----------+------------------+--------------+-----------------+-----------+----------+
//! |   magic   | sequence  |  payload_length  | content_hash |     payload     |   magic   |   pad    |
//! | (4 bytes) | (4 bytes) |     (4 bytes)    |   (4 bytes)  | (length bytes)  | (4 bytes) | (4 zero) |
//! +-----------+-----------+------------------+--------------+-----------------+-----------+----------+
//! ```
//!
//! Payload lengths are positive multiples of eight, so the four pad bytes
//! after the trailing magic keep every record size a multiple of eight. The
//! pad belongs to the record for all position arithmetic.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, StoreError};

/// Leading record marker.
pub const RECORD_MAGIC: u32 = 0x0001_0203;
/// Trailing record marker.
pub const RECORD_MAGIC_TAIL: u32 = 0x0302_0100;
/// Upper bound on a single event payload (512 KiB).
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024;
/// Bytes a record occupies beyond its payload: 16-byte header, trailing
/// magic, alignment pad.
pub const RECORD_OVERHEAD: usize = 24;

const HEADER_BYTES: usize = 16;

//─────────────────────────────
//  Raw event
//─────────────────────────────

/// A sequence-numbered event payload, validated at construction.
///
/// The payload length is guaranteed to be a positive multiple of eight and
/// at most [`MAX_PAYLOAD_BYTES`]; a `RawEvent` violating either bound cannot
/// be constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    sequence: u32,
    payload: Bytes,
}

impl RawEvent {
    /// Build a raw event, validating the payload bounds.
    pub fn new(sequence: u32, payload: Bytes) -> Result<Self> {
        if payload.is_empty() || payload.len() % 8 != 0 {
            return Err(StoreError::PayloadAlignment(payload.len()));
        }
        if payload.len() > MAX_PAYLOAD_BYTES {
            return Err(StoreError::PayloadTooLarge(payload.len()));
        }
        Ok(Self { sequence, payload })
    }

    /// The writer-assigned sequence number.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// The event payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size of this event's on-disk record, pad included.
    pub fn record_len(&self) -> usize {
        RECORD_OVERHEAD + self.payload.len()
    }
}

/// Deterministic 32-bit FNV-1a fold of the payload bytes.
pub fn checksum(payload: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in payload {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Total on-disk size of a batch of events.
pub fn encoded_len(events: &[RawEvent]) -> usize {
    events.iter().map(RawEvent::record_len).sum()
}

//─────────────────────────────
//  Encoding
//─────────────────────────────

/// Append the record for `event` to `buf`.
pub fn encode_record(buf: &mut BytesMut, event: &RawEvent) {
    buf.reserve(event.record_len());
    buf.put_u32_le(RECORD_MAGIC);
    buf.put_u32_le(event.sequence);
    buf.put_u32_le(event.payload.len() as u32);
    buf.put_u32_le(checksum(&event.payload));
    buf.put_slice(&event.payload);
    buf.put_u32_le(RECORD_MAGIC_TAIL);
    buf.put_u32_le(0);
}

//─────────────────────────────
//  Decoding
//─────────────────────────────

/// One step of record decoding.
#[derive(Debug, Clone)]
pub enum DecodeStep {
    /// A complete, verified record starting at the requested offset.
    Record {
        /// The decoded event; its payload is a zero-copy slice of the input.
        event: RawEvent,
        /// Offset just past this record, pad included.
        next_offset: usize,
    },
    /// The input ended cleanly before a record started.
    EndOfRecords,
    /// The bytes at the offset are not a complete, verified record. The
    /// caller must stop reading this blob at the record start offset.
    TruncatedTail,
}

fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

/// Decode the record starting at `offset` within `bytes`.
///
/// Any malformed framing - bad magic, a length that is not a positive
/// multiple of eight or exceeds the payload bound, a checksum mismatch, a
/// missing trailer - reads as [`DecodeStep::TruncatedTail`]: those bytes are
/// the debris of a crashed writer and everything from `offset` on is ignored.
pub fn decode_record(bytes: &Bytes, offset: usize) -> DecodeStep {
    if offset >= bytes.len() {
        return DecodeStep::EndOfRecords;
    }
    if bytes.len() - offset < HEADER_BYTES {
        return DecodeStep::TruncatedTail;
    }
    if read_u32_le(bytes, offset) != RECORD_MAGIC {
        return DecodeStep::TruncatedTail;
    }
    let sequence = read_u32_le(bytes, offset + 4);
    let length = read_u32_le(bytes, offset + 8) as usize;
    let expected_hash = read_u32_le(bytes, offset + 12);

    if length == 0 || length % 8 != 0 || length > MAX_PAYLOAD_BYTES {
        return DecodeStep::TruncatedTail;
    }
    let payload_start = offset + HEADER_BYTES;
    let record_end = payload_start + length + 8;
    if bytes.len() < record_end {
        return DecodeStep::TruncatedTail;
    }
    let payload = bytes.slice(payload_start..payload_start + length);
    if checksum(&payload) != expected_hash {
        return DecodeStep::TruncatedTail;
    }
    if read_u32_le(bytes, payload_start + length) != RECORD_MAGIC_TAIL {
        return DecodeStep::TruncatedTail;
    }
    if read_u32_le(bytes, payload_start + length + 4) != 0 {
        return DecodeStep::TruncatedTail;
    }

    DecodeStep::Record {
        event: RawEvent { sequence, payload },
        next_offset: record_end,
    }
}

/// Decode every whole record in `bytes`, returning the records and the
/// number of bytes they span. Decoding stops at the first truncated tail.
pub fn decode_batch(bytes: &Bytes) -> (Vec<RawEvent>, usize) {
    let mut events = Vec::new();
    let mut offset = 0;
    loop {
        match decode_record(bytes, offset) {
            DecodeStep::Record { event, next_offset } => {
                events.push(event);
                offset = next_offset;
            }
            DecodeStep::EndOfRecords | DecodeStep::TruncatedTail => break,
        }
    }
    (events, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u32, payload: &[u8]) -> RawEvent {
        RawEvent::new(sequence, Bytes::copy_from_slice(payload)).unwrap()
    }

    fn encode(events: &[RawEvent]) -> Bytes {
        let mut buf = BytesMut::new();
        for e in events {
            encode_record(&mut buf, e);
        }
        buf.freeze()
    }

    #[test]
    fn round_trip_preserves_sequence_and_payload() {
        let original = event(12, &[7u8; 64]);
        let encoded = encode(std::slice::from_ref(&original));
        assert_eq!(encoded.len() % 8, 0);
        assert_eq!(encoded.len(), original.record_len());

        match decode_record(&encoded, 0) {
            DecodeStep::Record { event, next_offset } => {
                assert_eq!(event.sequence(), 12);
                assert_eq!(event.payload(), original.payload());
                assert_eq!(next_offset, encoded.len());
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn invalid_payloads_are_unconstructible() {
        assert!(matches!(
            RawEvent::new(1, Bytes::new()),
            Err(StoreError::PayloadAlignment(0))
        ));
        assert!(matches!(
            RawEvent::new(1, Bytes::from(vec![0u8; 12])),
            Err(StoreError::PayloadAlignment(12))
        ));
        assert!(matches!(
            RawEvent::new(1, Bytes::from(vec![0u8; MAX_PAYLOAD_BYTES + 8])),
            Err(StoreError::PayloadTooLarge(_))
        ));
        assert!(RawEvent::new(1, Bytes::from(vec![0u8; MAX_PAYLOAD_BYTES])).is_ok());
    }

    #[test]
    fn empty_input_is_end_of_records() {
        assert!(matches!(
            decode_record(&Bytes::new(), 0),
            DecodeStep::EndOfRecords
        ));
    }

    #[test]
    fn short_header_is_truncated_tail() {
        let encoded = encode(&[event(3, &[1u8; 8])]);
        for cut in 1..HEADER_BYTES {
            let partial = encoded.slice(..cut);
            assert!(
                matches!(decode_record(&partial, 0), DecodeStep::TruncatedTail),
                "cut at {cut} should read as truncation"
            );
        }
    }

    #[test]
    fn short_payload_or_trailer_is_truncated_tail() {
        let encoded = encode(&[event(3, &[1u8; 32])]);
        for cut in HEADER_BYTES..encoded.len() {
            let partial = encoded.slice(..cut);
            assert!(matches!(decode_record(&partial, 0), DecodeStep::TruncatedTail));
        }
    }

    #[test]
    fn corrupted_hash_is_truncated_tail() {
        let encoded = encode(&[event(3, &[9u8; 16])]);
        let mut raw = encoded.to_vec();
        raw[HEADER_BYTES] ^= 0xff; // flip one payload byte
        assert!(matches!(
            decode_record(&Bytes::from(raw), 0),
            DecodeStep::TruncatedTail
        ));
    }

    #[test]
    fn bad_leading_magic_is_truncated_tail() {
        let encoded = encode(&[event(3, &[9u8; 16])]);
        let mut raw = encoded.to_vec();
        raw[0] ^= 0x01;
        assert!(matches!(
            decode_record(&Bytes::from(raw), 0),
            DecodeStep::TruncatedTail
        ));
    }

    #[test]
    fn batch_stops_at_first_bad_record() {
        let first = event(1, &[1u8; 8]);
        let second = event(2, &[2u8; 8]);
        let encoded = encode(&[first.clone(), second]);
        let mut raw = encoded.to_vec();
        let tail_start = first.record_len();
        raw[tail_start + 4] ^= 0xff; // corrupt the second record's sequence

        let (events, consumed) = decode_batch(&Bytes::from(raw));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence(), 1);
        assert_eq!(consumed, first.record_len());
    }

    #[test]
    fn checksum_matches_known_fnv1a_vectors() {
        assert_eq!(checksum(b""), 0x811c_9dc5);
        assert_eq!(checksum(b"a"), 0xe40c_292c);
        assert_eq!(checksum(b"foobar"), 0xbf9c_f968);
    }
}
