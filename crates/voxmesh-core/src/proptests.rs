//! Property-based tests for the wire format and splitter.
//!
//! - Splitting then concatenating is the identity
//! - Every chunk envelope fits the wire budget it was planned for
//! - Any corruption of a chunk payload, raw or encoded, is caught

use bytes::Bytes;
use proptest::prelude::*;

use crate::integrity::{crc32, encode_binary_safe};
use crate::splitter::{split, SplitError};
use crate::wire::{verify_chunk, ChunkEnvelope, Envelope};

// ==================== Splitter Property Tests ====================

proptest! {
    /// Concatenating the chunks in order restores the input.
    #[test]
    fn split_then_concat_is_identity(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        budget in 120usize..400,
    ) {
        let data = Bytes::from(data);
        match split(&data, budget) {
            Ok(chunks) => {
                prop_assert!(chunks.iter().all(|c| !c.is_empty()));
                prop_assert_eq!(chunks.concat(), data.to_vec());
            }
            Err(SplitError::BudgetTooSmall { .. }) => {}
            Err(e) => prop_assert!(false, "unexpected error: {e}"),
        }
    }

    /// No chunk envelope exceeds its budget.
    #[test]
    fn chunk_envelopes_fit_budget(
        data in prop::collection::vec(any::<u8>(), 1..3000),
        budget in 150usize..260,
    ) {
        let data = Bytes::from(data);
        let chunks = split(&data, budget).unwrap();
        let total = chunks.len() as u32;
        for (i, chunk) in chunks.iter().enumerate() {
            let envelope = ChunkEnvelope::new("0f0f0f0f", i as u32 + 1, total, chunk);
            let encoded = Envelope::from(envelope).encode().unwrap();
            prop_assert!(encoded.len() <= budget);
        }
    }
}

// ==================== Envelope Property Tests ====================

proptest! {
    /// Chunk envelopes survive encode/parse unchanged.
    #[test]
    fn chunk_envelope_roundtrip(
        id in "[0-9a-f]{8}",
        num in 1u32..1000,
        extra in 0u32..1000,
        raw in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let chunk = ChunkEnvelope::new(id, num, num + extra, &raw);
        let bytes = Envelope::from(chunk.clone()).encode().unwrap();
        prop_assert_eq!(ChunkEnvelope::parse(&bytes).unwrap(), chunk);
    }

    /// Flipping any bit of the raw payload fails verification.
    #[test]
    fn single_bit_flip_is_detected(
        raw in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut chunk = ChunkEnvelope::new("00000000", 1, 1, &raw);
        let mut tampered = raw.clone();
        let i = index.index(tampered.len());
        tampered[i] ^= 1 << bit;
        chunk.data = encode_binary_safe(&tampered);

        prop_assert_ne!(crc32(&tampered), chunk.crc32);
        prop_assert!(verify_chunk(&chunk).is_none());
    }

    /// Flipping any bit of the encoded `data` field fails verification,
    /// whether it breaks the encoding or decodes to different bytes.
    #[test]
    fn encoded_bit_flip_is_detected(
        raw in prop::collection::vec(any::<u8>(), 1..256),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut chunk = ChunkEnvelope::new("00000000", 1, 1, &raw);
        let mut field = chunk.data.clone().into_bytes();
        let i = index.index(field.len());
        field[i] ^= 1 << bit;
        let Ok(tampered) = String::from_utf8(field) else {
            return Err(TestCaseError::reject("flip left invalid UTF-8"));
        };
        chunk.data = tampered;

        prop_assert!(verify_chunk(&chunk).is_none());
    }

    /// Arbitrary bytes never panic the parser.
    #[test]
    fn parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Envelope::parse(&data);
    }
}
