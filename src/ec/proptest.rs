//! Property-Based Tests for Erasure Coding
//!
//! Uses proptest to systematically verify EC encoder/decoder correctness
//! across a wide range of inputs and object classes.
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: encode(data) → decode(shards) = data
//! 2. **Shard Independence**: Any k shards can reconstruct data
//! 3. **Insufficiency**: Fewer than k shards always fails
//! 4. **Determinism**: Same input always produces same output

#![cfg(test)]

use proptest::prelude::*;

use super::encoder::{create_codec, EcEncoder, EncodedObject, ShardPayload};
use super::object_class::ObjectClass;
use crate::error::Error;

// =============================================================================
// Property Strategies
// =============================================================================

/// Strategy for k+m classes, including zero parity.
fn class_strategy() -> impl Strategy<Value = ObjectClass> {
    (1usize..=8, 0usize..=4).prop_map(|(k, m)| ObjectClass::new(k, m).unwrap())
}

/// Strategy for payloads, including the empty payload.
fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..2000)
}

/// A class plus a subset of shard indices to keep.
fn class_and_survivors() -> impl Strategy<Value = (ObjectClass, Vec<usize>)> {
    class_strategy().prop_flat_map(|class| {
        let total = class.total_shards();
        (
            Just(class),
            prop::sample::subsequence((0..total).collect::<Vec<_>>(), 0..=total),
        )
    })
}

fn keep_only(encoded: &EncodedObject, keep: &[usize]) -> Vec<Option<ShardPayload>> {
    encoded
        .shards
        .iter()
        .map(|s| keep.contains(&s.index).then(|| s.clone()))
        .collect()
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Encoding then decoding without any losses returns the original data.
    #[test]
    fn prop_roundtrip_no_loss(class in class_strategy(), data in data_strategy()) {
        let (encoder, decoder) = create_codec(class)?;

        let encoded = encoder.encode(&data)?;
        prop_assert_eq!(encoded.shards.len(), class.total_shards());

        let shards: Vec<Option<ShardPayload>> = encoded.shards.into_iter().map(Some).collect();
        let recovered = decoder.decode(&shards, data.len())?;

        prop_assert_eq!(recovered, data, "Roundtrip failed for {}", class);
    }

    /// Property: any survivor set of at least k shards decodes; smaller sets fail.
    #[test]
    fn prop_any_survivor_set(
        (class, keep) in class_and_survivors(),
        data in prop::collection::vec(any::<u8>(), 1..500),
    ) {
        let (encoder, decoder) = create_codec(class)?;
        let encoded = encoder.encode(&data)?;
        let shards = keep_only(&encoded, &keep);

        let result = decoder.decode(&shards, data.len());
        if keep.len() >= class.data_shards() {
            prop_assert_eq!(result?, data, "Recovery failed for {} keeping {:?}", class, keep);
        } else {
            let insufficient = matches!(result, Err(Error::InsufficientShards { .. }));
            prop_assert!(insufficient, "Expected InsufficientShards for {} keeping {:?}", class, keep);
        }
    }

    /// Property: rebuilding the missing shards restores the exact encoding.
    #[test]
    fn prop_reconstruct_restores_all_shards(
        (class, keep) in class_and_survivors(),
        data in prop::collection::vec(any::<u8>(), 1..500),
    ) {
        prop_assume!(keep.len() >= class.data_shards());

        let (encoder, decoder) = create_codec(class)?;
        let encoded = encoder.encode(&data)?;
        let rebuilt = decoder.reconstruct(&keep_only(&encoded, &keep))?;

        prop_assert_eq!(rebuilt, encoded.shards);
    }
}

// =============================================================================
// Layout Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// Property: All data shards together contain all original data (with padding).
    #[test]
    fn prop_data_shards_contain_all_data(class in class_strategy(), data in data_strategy()) {
        let encoder = EcEncoder::new(class)?;
        let encoded = encoder.encode(&data)?;

        let mut concatenated: Vec<u8> = Vec::new();
        for shard in encoded.shards.iter().take(class.data_shards()) {
            concatenated.extend_from_slice(&shard.data);
        }

        prop_assert!(concatenated.len() >= data.len());
        prop_assert_eq!(&concatenated[..data.len()], data.as_slice());
        prop_assert!(concatenated[data.len()..].iter().all(|b| *b == 0));
    }

    /// Property: Encoding is deterministic across encoder instances.
    #[test]
    fn prop_encoding_deterministic(class in class_strategy(), data in data_strategy()) {
        let shards1 = EcEncoder::new(class)?.encode(&data)?.shards;
        let shards2 = EcEncoder::new(class)?.encode(&data)?.shards;

        prop_assert_eq!(shards1, shards2, "Encoding should be deterministic");
    }
}
