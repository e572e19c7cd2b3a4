//! EC Integration Tests
//!
//! End-to-end tests for the erasure codec through the public API.

use assert_matches::assert_matches;
use healpool::ec::{create_codec, EcDecoder, EcEncoder, ObjectClass, ShardPayload};
use healpool::Error;

fn class(s: &str) -> ObjectClass {
    s.parse().expect("valid object class")
}

fn slots(shards: Vec<ShardPayload>) -> Vec<Option<ShardPayload>> {
    shards.into_iter().map(Some).collect()
}

// =============================================================================
// Encoder/Decoder Integration Tests
// =============================================================================

#[test]
fn test_encode_decode_full_pipeline() {
    let (encoder, decoder) = create_codec(class("EC_4P2")).expect("Failed to create codec");

    let original_data = b"This is test data for the full EC pipeline integration test. It should be long enough to span multiple shards.";

    let encoded = encoder.encode(original_data).expect("Failed to encode");
    assert_eq!(encoded.shards.len(), 6);
    assert_eq!(encoded.original_len, original_data.len());
    assert!(encoder.verify(&encoded.shards).expect("Verify failed"));

    let recovered = decoder
        .decode(&slots(encoded.shards), original_data.len())
        .expect("Failed to decode");
    assert_eq!(recovered, original_data);
}

#[test]
fn test_encode_decode_with_max_shard_loss() {
    let (encoder, decoder) = create_codec(class("EC_4P2")).unwrap();
    let original_data = b"Data for maximum shard loss recovery test with 4+2 configuration.";

    let encoded = encoder.encode(original_data).unwrap();
    let mut shards = slots(encoded.shards);
    shards[0] = None;
    shards[5] = None;

    let recovered = decoder.decode(&shards, original_data.len()).unwrap();
    assert_eq!(recovered, original_data);
}

#[test]
fn test_encode_decode_beyond_max_loss_fails() {
    let (encoder, decoder) = create_codec(class("EC_4P2")).unwrap();
    let original_data = b"Three losses are one too many.";

    let encoded = encoder.encode(original_data).unwrap();
    let mut shards = slots(encoded.shards);
    shards[0] = None;
    shards[1] = None;
    shards[2] = None;

    assert_matches!(
        decoder.decode(&shards, original_data.len()),
        Err(Error::InsufficientShards {
            available: 3,
            required: 4
        })
    );
}

#[test]
fn test_different_object_classes() {
    let data: Vec<u8> = (0..1000).map(|i| (i % 251) as u8).collect();

    for name in ["EC_1P0", "EC_1P2", "EC_2P1", "OC_EC_2P1G1", "EC_4P2GX", "8+3", "EC_16P2"] {
        let class = class(name);
        let (encoder, decoder) = create_codec(class).unwrap();
        let encoded = encoder.encode(&data).unwrap();
        assert_eq!(encoded.shards.len(), class.total_shards(), "{}", name);

        // Drop as many leading shards as the class tolerates.
        let mut shards = slots(encoded.shards);
        for slot in shards.iter_mut().take(class.parity_shards()) {
            *slot = None;
        }
        assert_eq!(decoder.decode(&shards, data.len()).unwrap(), data, "{}", name);
    }
}

#[test]
fn test_large_data_encoding() {
    let (encoder, decoder) = create_codec(class("EC_4P2")).unwrap();
    let original_data: Vec<u8> = (0..1024 * 1024).map(|i| (i * 7 % 256) as u8).collect();

    let encoded = encoder.encode(&original_data).unwrap();
    assert_eq!(encoded.shard_size, 256 * 1024);

    let mut shards = slots(encoded.shards);
    shards[1] = None;
    shards[4] = None;

    let recovered = decoder.decode(&shards, original_data.len()).unwrap();
    assert_eq!(recovered, original_data);
}

#[test]
fn test_reconstruction_restores_checksums() {
    let encoder = EcEncoder::new(class("EC_2P1")).unwrap();
    let decoder = EcDecoder::new(class("EC_2P1")).unwrap();

    let encoded = encoder.encode(b"rebuild me").unwrap();
    let expected = encoded.checksums();

    for lost in 0..3 {
        let mut shards = slots(encoded.shards.clone());
        shards[lost] = None;

        let rebuilt = decoder.reconstruct(&shards).unwrap();
        assert_eq!(rebuilt.len(), 3);
        assert_eq!(rebuilt[lost].checksum, expected[lost]);
        assert_eq!(rebuilt[lost].index, lost);
        assert!(rebuilt[lost].verify().is_ok());
    }
}

#[test]
fn test_corrupt_shard_rejected_by_decoder() {
    let (encoder, decoder) = create_codec(class("EC_2P1")).unwrap();
    let encoded = encoder.encode(b"checksummed payload").unwrap();

    let mut shards = slots(encoded.shards);
    if let Some(shard) = shards[0].as_mut() {
        let mut bytes = shard.data.to_vec();
        bytes[0] ^= 0xFF;
        shard.data = bytes.into();
    }

    assert_matches!(
        decoder.decode(&shards, 19),
        Err(Error::CorruptShard { shard_index: 0, .. })
    );
}

#[test]
fn test_empty_object() {
    let (encoder, decoder) = create_codec(class("EC_2P1")).unwrap();
    let encoded = encoder.encode(&[]).unwrap();
    assert_eq!(encoded.shard_size, 1);

    let mut shards = slots(encoded.shards);
    shards[1] = None;
    assert!(decoder.decode(&shards, 0).unwrap().is_empty());
}

#[test]
fn test_invalid_classes() {
    assert_matches!("EC_0P1".parse::<ObjectClass>(), Err(Error::InvalidObjectClass { .. }));
    assert_matches!("RP_2G1".parse::<ObjectClass>(), Err(Error::InvalidObjectClass { .. }));
    assert_matches!(ObjectClass::new(200, 100), Err(Error::InvalidObjectClass { .. }));
}
