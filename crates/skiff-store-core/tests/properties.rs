//! Property tests for the record codec and blob naming.

use bytes::{Bytes, BytesMut};
use proptest::prelude::*;

use skiff_store_core::{
    decode_record, encode_record, BlobName, DecodeStep, RawEvent, RECORD_OVERHEAD,
};

fn payloads() -> impl Strategy<Value = Vec<u8>> {
    // Positive multiples of 8, up to 4 KiB - large enough to exercise the
    // framing, small enough to keep the suite quick.
    (1usize..=512).prop_flat_map(|words| proptest::collection::vec(any::<u8>(), words * 8))
}

proptest! {
    #[test]
    fn serialize_then_deserialize_is_identity(sequence in any::<u32>(), payload in payloads()) {
        let event = RawEvent::new(sequence, Bytes::from(payload.clone())).unwrap();
        let mut buf = BytesMut::new();
        encode_record(&mut buf, &event);
        let encoded = buf.freeze();

        prop_assert_eq!(encoded.len() % 8, 0);
        prop_assert_eq!(encoded.len(), RECORD_OVERHEAD + payload.len());

        match decode_record(&encoded, 0) {
            DecodeStep::Record { event: decoded, next_offset } => {
                prop_assert_eq!(decoded.sequence(), sequence);
                prop_assert_eq!(decoded.payload().as_ref(), payload.as_slice());
                prop_assert_eq!(next_offset, encoded.len());
            }
            other => prop_assert!(false, "expected record, got {:?}", other),
        }
    }

    #[test]
    fn misaligned_payloads_cannot_be_constructed(sequence in any::<u32>(), len in 1usize..4096) {
        prop_assume!(len % 8 != 0);
        prop_assert!(RawEvent::new(sequence, Bytes::from(vec![0u8; len])).is_err());
    }

    #[test]
    fn blob_names_round_trip(index in 0u32..100_000) {
        let name = format!("events.{index:05}");
        prop_assert_eq!(BlobName::parse_events(&name).unwrap().index(), index);
        let with_suffix = format!("{}.compact", name);
        prop_assert!(BlobName::parse_events(&with_suffix).is_err());
    }

    #[test]
    fn non_decimal_blob_indices_are_rejected(suffix in "[0-9a-f]{5}") {
        prop_assume!(!suffix.bytes().all(|b| b.is_ascii_digit()));
        let name = format!("events.{}", suffix);
        prop_assert!(BlobName::parse_events(&name).is_err());
    }
}
