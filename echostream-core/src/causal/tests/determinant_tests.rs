use super::*;
use crate::causal::CausalError;
use crate::types::DatasetId;

fn all_variants() -> Vec<Determinant> {
    vec![
        Determinant::Order { channel: 3 },
        Determinant::RandomEmit { channel: 200 },
        Determinant::Timestamp {
            millis: 1_700_000_000_000,
        },
        Determinant::Rng { value: 42 },
        Determinant::Rng { value: -42 },
        Determinant::Timestamp { millis: i64::MIN },
        Determinant::BufferBuilt {
            dataset: DatasetId::new(0x11, 0x22),
            subpartition: 1,
            bytes: 4096,
        },
    ]
}

#[test]
fn test_roundtrip_every_variant() {
    for d in all_variants() {
        let encoded = d.encode();
        assert_eq!(encoded.len(), d.encoded_len(), "length for {d}");
        let mut cursor = DeterminantCursor::new(&encoded);
        assert_eq!(cursor.decode_next().unwrap(), Some(d));
        assert_eq!(cursor.decode_next().unwrap(), None);
        assert_eq!(cursor.consumed(), encoded.len());
    }
}

#[test]
fn test_roundtrip_concatenated_sequence() {
    let sequence = all_variants();
    let mut log = Vec::new();
    for d in &sequence {
        d.encode_into(&mut log);
    }
    assert_eq!(decode_all(&log).unwrap(), sequence);
}

#[test]
fn test_mixed_sequence_encoded_length() {
    // Order + RNG + Timestamp + BufferBuilt: 2 + 5 + 9 + 22 bytes.
    let sequence = vec![
        Determinant::Order { channel: 3 },
        Determinant::Rng { value: 42 },
        Determinant::Timestamp {
            millis: 1_700_000_000_000,
        },
        Determinant::BufferBuilt {
            dataset: DatasetId::new(0x11, 0x22),
            subpartition: 1,
            bytes: 4096,
        },
    ];
    let mut log = Vec::new();
    for d in &sequence {
        d.encode_into(&mut log);
    }
    assert_eq!(log.len(), 38);
    assert_eq!(decode_all(&log).unwrap(), sequence);
}

#[test]
fn test_order_encoding_writes_tag_byte() {
    let encoded = Determinant::Order { channel: 7 }.encode();
    assert_eq!(encoded, vec![ORDER_TAG, 7]);
}

#[test]
fn test_wire_layout_is_big_endian() {
    let encoded = Determinant::Timestamp { millis: 0x0102 }.encode();
    assert_eq!(encoded, vec![TIMESTAMP_TAG, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);

    let encoded = Determinant::Rng { value: -1 }.encode();
    assert_eq!(encoded, vec![RNG_TAG, 0xff, 0xff, 0xff, 0xff]);

    let encoded = Determinant::BufferBuilt {
        dataset: DatasetId::new(0x11, 0x22),
        subpartition: 5,
        bytes: 0x0304,
    }
    .encode();
    assert_eq!(encoded.len(), 22);
    assert_eq!(encoded[0], BUFFER_BUILT_TAG);
    assert_eq!(encoded[8], 0x11); // upper half, big-endian
    assert_eq!(encoded[16], 0x22); // lower half, big-endian
    assert_eq!(encoded[17], 5);
    assert_eq!(&encoded[18..22], &[0, 0, 0x03, 0x04]);
}

#[test]
fn test_unknown_tag_is_corrupt_log() {
    let err = decode_all(&[0x7f, 0x00]).unwrap_err();
    assert!(matches!(err, CausalError::CorruptLog(_)), "got {err:?}");
}

#[test]
fn test_truncated_payload_is_corrupt_log() {
    // Timestamp with only 4 of its 8 payload bytes.
    let err = decode_all(&[TIMESTAMP_TAG, 0, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, CausalError::CorruptLog(_)), "got {err:?}");

    // BufferBuilt cut off inside the dataset id.
    let err = decode_all(&[BUFFER_BUILT_TAG, 0, 0, 0]).unwrap_err();
    assert!(matches!(err, CausalError::CorruptLog(_)), "got {err:?}");
}

#[test]
fn test_cursor_stops_at_exact_boundary() {
    let mut log = Determinant::Order { channel: 1 }.encode();
    log.extend(Determinant::Order { channel: 2 }.encode());

    let mut cursor = DeterminantCursor::new(&log);
    assert_eq!(
        cursor.decode_next().unwrap(),
        Some(Determinant::Order { channel: 1 })
    );
    assert_eq!(cursor.remaining(), 2);
    assert_eq!(
        cursor.decode_next().unwrap(),
        Some(Determinant::Order { channel: 2 })
    );
    assert_eq!(cursor.remaining(), 0);
    assert_eq!(cursor.decode_next().unwrap(), None);
}
