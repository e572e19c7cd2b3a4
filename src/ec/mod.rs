//! Erasure Coding Module
//!
//! Splits object bytes into data shards and computes parity shards with a
//! systematic Reed-Solomon code over GF(2^8), and reconstructs the original
//! bytes from any `data_shards` surviving shards.
//!
//! # Components
//!
//! - **Object classes** (`object_class.rs`): parse and validate `EC_<d>P<p>`
//!   layouts.
//! - **Encoder/Decoder** (`encoder.rs`): Reed-Solomon encoding and decoding
//!   using the `reed-solomon-erasure` crate. Provides functions to:
//!   - Encode data into k data shards + m parity shards, each checksummed
//!   - Reconstruct missing shards from survivors
//!   - Verify stripe integrity
//!
//! # Usage
//!
//! ```rust
//! use healpool::ec::{create_codec, ObjectClass};
//!
//! let class: ObjectClass = "EC_4P2".parse().unwrap();
//! let (encoder, decoder) = create_codec(class).unwrap();
//!
//! let data = b"Hello, World!";
//! let encoded = encoder.encode(data).unwrap();
//!
//! let mut shards: Vec<_> = encoded.shards.into_iter().map(Some).collect();
//! shards[0] = None; // Lose first shard
//! shards[3] = None; // Lose fourth shard
//!
//! let recovered = decoder.decode(&shards, data.len()).unwrap();
//! assert_eq!(recovered, data);
//! ```

pub mod encoder;
pub mod object_class;

#[cfg(test)]
mod proptest;

pub use encoder::{
    calculate_shard_size, checksum, create_codec, storage_efficiency, storage_overhead,
    EcDecoder, EcEncoder, EncodedObject, ShardPayload,
};
pub use object_class::{ObjectClass, MAX_TOTAL_SHARDS};
