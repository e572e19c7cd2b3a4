//! Error types for healpool

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the storage pools
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Object, shard, pool, container or target absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Erasure Coding Errors
    // =========================================================================
    /// EC encoding failed
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// EC reconstruction failed
    #[error("EC reconstruction failed for object {object_id}: {reason}")]
    EcReconstructionFailed { object_id: String, reason: String },

    /// Insufficient shards for reconstruction
    #[error("Insufficient shards for reconstruction: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// A shard failed checksum validation
    #[error("Corrupt shard {shard_index}: checksum {actual:#010x}, expected {expected:#010x}")]
    CorruptShard {
        shard_index: usize,
        expected: u32,
        actual: u32,
    },

    /// Invalid EC configuration
    #[error("Invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    /// Object class identifier could not be parsed or is out of range
    #[error("Invalid object class '{class}': {reason}")]
    InvalidObjectClass { class: String, reason: String },

    // =========================================================================
    // Pool Errors
    // =========================================================================
    /// Placement cannot satisfy the requested redundancy
    #[error("Insufficient targets: have {available} live, need {required}")]
    InsufficientTargets { available: usize, required: usize },

    /// Redundancy factor misconfigured for the container or object class
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Size parse error
    #[error("Failed to parse size: {0}")]
    SizeParse(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),
}

impl Error {
    /// Shorthand for a `NotFound` naming the kind of thing that was missing.
    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("{} {}", kind, id))
    }
}
