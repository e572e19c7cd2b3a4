//! Erasure Coding Encoder/Decoder
//!
//! Implements Reed-Solomon encoding and decoding using the `reed-solomon-erasure` crate.
//! Every shard carries a CRC32 of its payload so that a corrupt shard is never
//! fed into reconstruction.

use crate::domain::ports::ShardKind;
use crate::ec::object_class::ObjectClass;
use crate::error::{Error, Result};
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;
use tracing::{debug, instrument};

// =============================================================================
// Shard Payload
// =============================================================================

/// One encoded shard together with its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPayload {
    pub index: usize,
    pub kind: ShardKind,
    pub data: Bytes,
    pub checksum: u32,
}

impl ShardPayload {
    /// Wrap shard bytes, computing their checksum.
    pub fn new(index: usize, kind: ShardKind, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let checksum = checksum(&data);
        Self {
            index,
            kind,
            data,
            checksum,
        }
    }

    /// Verify the payload against its checksum.
    pub fn verify(&self) -> Result<()> {
        let actual = checksum(&self.data);
        if actual != self.checksum {
            return Err(Error::CorruptShard {
                shard_index: self.index,
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }
}

/// Output of encoding one object.
#[derive(Debug, Clone)]
pub struct EncodedObject {
    /// Data shards followed by parity shards
    pub shards: Vec<ShardPayload>,
    /// Length of the input before padding
    pub original_len: usize,
    /// Size of every shard
    pub shard_size: usize,
}

impl EncodedObject {
    pub fn checksums(&self) -> Vec<u32> {
        self.shards.iter().map(|s| s.checksum).collect()
    }
}

/// CRC32 used for every persisted shard.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

fn build_codec(class: &ObjectClass) -> Result<Option<Arc<ReedSolomon>>> {
    // Plain striping needs no codec: every data shard is required on decode.
    if class.parity_shards() == 0 {
        return Ok(None);
    }

    let rs = ReedSolomon::new(class.data_shards(), class.parity_shards()).map_err(|e| {
        Error::InvalidEcConfig(format!("Failed to create Reed-Solomon codec: {}", e))
    })?;
    Ok(Some(Arc::new(rs)))
}

// =============================================================================
// EC Encoder
// =============================================================================

/// Erasure coding encoder for creating parity shards from data shards
pub struct EcEncoder {
    /// Reed-Solomon codec instance, absent for zero-parity classes
    rs: Option<Arc<ReedSolomon>>,
    class: ObjectClass,
}

impl EcEncoder {
    /// Create a new encoder for the given object class
    pub fn new(class: ObjectClass) -> Result<Self> {
        Ok(Self {
            rs: build_codec(&class)?,
            class,
        })
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn data_shards(&self) -> usize {
        self.class.data_shards()
    }

    pub fn parity_shards(&self) -> usize {
        self.class.parity_shards()
    }

    pub fn total_shards(&self) -> usize {
        self.class.total_shards()
    }

    /// Encode data into shards (data + parity)
    ///
    /// The input is zero-padded to a multiple of the data shard count. Shards
    /// are at least one byte long so that an empty object still encodes.
    #[instrument(skip(self, data), fields(class = %self.class, data_len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<EncodedObject> {
        let shard_size = calculate_shard_size(data.len(), self.data_shards());
        let mut shards = self.split(data, shard_size);

        if let Some(rs) = &self.rs {
            for _ in 0..self.parity_shards() {
                shards.push(vec![0u8; shard_size]);
            }
            rs.encode(&mut shards).map_err(|e| {
                Error::EcEncodingFailed(format!("Reed-Solomon encoding failed: {}", e))
            })?;
        }

        debug!(
            "Encoded {} bytes into {} shards of {} bytes each",
            data.len(),
            self.total_shards(),
            shard_size
        );

        let data_shards = self.data_shards();
        Ok(EncodedObject {
            shards: shards
                .into_iter()
                .enumerate()
                .map(|(i, s)| ShardPayload::new(i, ShardKind::for_index(i, data_shards), s))
                .collect(),
            original_len: data.len(),
            shard_size,
        })
    }

    fn split(&self, data: &[u8], shard_size: usize) -> Vec<Vec<u8>> {
        let mut shards = Vec::with_capacity(self.total_shards());
        for i in 0..self.data_shards() {
            let start = i * shard_size;
            let end = std::cmp::min(start + shard_size, data.len());

            let mut shard = if start < data.len() {
                data[start..end].to_vec()
            } else {
                Vec::new()
            };
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        shards
    }

    /// Verify that the parity shards are consistent with data shards
    pub fn verify(&self, shards: &[ShardPayload]) -> Result<bool> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let Some(rs) = &self.rs else {
            return Ok(true);
        };
        let slices: Vec<&[u8]> = shards.iter().map(|s| s.data.as_ref()).collect();
        rs.verify(&slices)
            .map_err(|e| Error::EcEncodingFailed(format!("Verification failed: {}", e)))
    }
}

// =============================================================================
// EC Decoder
// =============================================================================

/// Erasure coding decoder for reconstructing missing shards
pub struct EcDecoder {
    rs: Option<Arc<ReedSolomon>>,
    class: ObjectClass,
}

impl EcDecoder {
    /// Create a new decoder for the given object class
    pub fn new(class: ObjectClass) -> Result<Self> {
        Ok(Self {
            rs: build_codec(&class)?,
            class,
        })
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn data_shards(&self) -> usize {
        self.class.data_shards()
    }

    pub fn parity_shards(&self) -> usize {
        self.class.parity_shards()
    }

    pub fn total_shards(&self) -> usize {
        self.class.total_shards()
    }

    /// Validate slot count and checksums, and convert into the codec's form.
    fn prepare(&self, shards: &[Option<ShardPayload>]) -> Result<Vec<Option<Vec<u8>>>> {
        if shards.len() != self.total_shards() {
            return Err(Error::InvalidEcConfig(format!(
                "Expected {} shards, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        for shard in shards.iter().flatten() {
            shard.verify()?;
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards() {
            return Err(Error::InsufficientShards {
                available,
                required: self.data_shards(),
            });
        }

        Ok(shards
            .iter()
            .map(|s| s.as_ref().map(|p| p.data.to_vec()))
            .collect())
    }

    /// Reconstruct all missing shards (data and parity)
    ///
    /// Returns the complete shard set, in index order, with fresh checksums
    /// for rebuilt shards.
    #[instrument(skip(self, shards), fields(class = %self.class))]
    pub fn reconstruct(&self, shards: &[Option<ShardPayload>]) -> Result<Vec<ShardPayload>> {
        let mut raw = self.prepare(shards)?;

        if let Some(rs) = &self.rs {
            rs.reconstruct(&mut raw).map_err(|e| Error::EcReconstructionFailed {
                object_id: String::new(),
                reason: format!("Reed-Solomon reconstruction failed: {}", e),
            })?;
        }

        let data_shards = self.data_shards();
        raw.into_iter()
            .enumerate()
            .map(|(i, s)| match (&shards[i], s) {
                (Some(existing), _) => Ok(existing.clone()),
                (None, Some(bytes)) => {
                    Ok(ShardPayload::new(i, ShardKind::for_index(i, data_shards), bytes))
                }
                (None, None) => Err(Error::EcReconstructionFailed {
                    object_id: String::new(),
                    reason: format!("shard {} was not reconstructed", i),
                }),
            })
            .collect()
    }

    /// Decode shards back to original data
    ///
    /// Reconstructs missing data shards if necessary, then combines them
    /// and trims the padding.
    ///
    /// # Arguments
    /// * `shards` - One slot per shard index, `None` for missing shards
    /// * `original_len` - Size of the original data (to trim padding)
    #[instrument(skip(self, shards), fields(class = %self.class))]
    pub fn decode(&self, shards: &[Option<ShardPayload>], original_len: usize) -> Result<Vec<u8>> {
        let mut raw = self.prepare(shards)?;

        let missing_data = raw.iter().take(self.data_shards()).any(|s| s.is_none());
        if missing_data {
            if let Some(rs) = &self.rs {
                rs.reconstruct_data(&mut raw)
                    .map_err(|e| Error::EcReconstructionFailed {
                        object_id: String::new(),
                        reason: format!("Reed-Solomon data reconstruction failed: {}", e),
                    })?;
            }
            debug!(
                "Reconstructed data shards from {}/{} available",
                shards.iter().filter(|s| s.is_some()).count(),
                self.total_shards()
            );
        }

        let mut data = Vec::with_capacity(original_len);
        for s in raw.iter().take(self.data_shards()) {
            let s = s.as_ref().ok_or_else(|| Error::InsufficientShards {
                available: shards.iter().filter(|s| s.is_some()).count(),
                required: self.data_shards(),
            })?;
            data.extend_from_slice(s);
        }

        if data.len() < original_len {
            return Err(Error::EcReconstructionFailed {
                object_id: String::new(),
                reason: format!(
                    "decoded {} bytes, expected at least {}",
                    data.len(),
                    original_len
                ),
            });
        }
        data.truncate(original_len);

        Ok(data)
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Create an encoder/decoder pair with the same configuration
pub fn create_codec(class: ObjectClass) -> Result<(EcEncoder, EcDecoder)> {
    let encoder = EcEncoder::new(class)?;
    let decoder = EcDecoder::new(class)?;
    Ok((encoder, decoder))
}

/// Calculate the shard size for given data size and shard count
pub fn calculate_shard_size(data_size: usize, data_shards: usize) -> usize {
    data_size.div_ceil(data_shards).max(1)
}

/// Calculate storage overhead ratio (total/data)
pub fn storage_overhead(data_shards: usize, parity_shards: usize) -> f64 {
    (data_shards + parity_shards) as f64 / data_shards as f64
}

/// Calculate storage efficiency ratio (data/total)
pub fn storage_efficiency(data_shards: usize, parity_shards: usize) -> f64 {
    data_shards as f64 / (data_shards + parity_shards) as f64
}

// =============================================================================
// Tests
// =============================================================================
