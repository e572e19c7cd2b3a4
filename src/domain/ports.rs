//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared across the pool layer and
//! the core abstractions (ports) it depends on. Infrastructure adapters
//! implement these traits to provide concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │   ShardStore   │   StoreFactory   │  EventPublisher  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ FileShardStore │ InMemoryShardStore │ LoggingEvents │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// Value Objects
// =============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    Error::Internal(format!("invalid {} '{}': {}", stringify!($name), s, e))
                })
            }
        }
    };
}

uuid_id!(
    /// Pool-scoped object identifier, created at write time.
    ObjectId
);
uuid_id!(
    /// Pool identifier.
    PoolId
);
uuid_id!(
    /// Container identifier.
    ContainerId
);

/// One storage server rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub u32);

impl TargetId {
    pub fn new(rank: u32) -> Self {
        Self(rank)
    }

    pub fn rank(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rank-{}", self.0)
    }
}

impl From<u32> for TargetId {
    fn from(rank: u32) -> Self {
        Self(rank)
    }
}

/// Kind of shard within an encoded object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardKind {
    Data,
    Parity,
}

impl ShardKind {
    /// Kind of the shard at `index` for an object with `data_shards` data shards.
    pub fn for_index(index: usize, data_shards: usize) -> Self {
        if index < data_shards {
            ShardKind::Data
        } else {
            ShardKind::Parity
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            ShardKind::Data => 0,
            ShardKind::Parity => 1,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ShardKind::Data),
            1 => Some(ShardKind::Parity),
            _ => None,
        }
    }
}

impl std::fmt::Display for ShardKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardKind::Data => write!(f, "data"),
            ShardKind::Parity => write!(f, "parity"),
        }
    }
}

/// Store key of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey {
    pub object_id: ObjectId,
    pub shard_index: usize,
}

impl ShardKey {
    pub fn new(object_id: ObjectId, shard_index: usize) -> Self {
        Self {
            object_id,
            shard_index,
        }
    }
}

impl std::fmt::Display for ShardKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.object_id, self.shard_index)
    }
}

/// Persisted form of a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRecord {
    pub object_id: ObjectId,
    pub shard_index: usize,
    pub kind: ShardKind,
    /// CRC32 of `payload` as computed by the writer.
    pub checksum: u32,
    pub payload: Bytes,
}

impl ShardRecord {
    pub fn key(&self) -> ShardKey {
        ShardKey::new(self.object_id, self.shard_index)
    }

    /// Checksum of the payload as it is now.
    pub fn actual_checksum(&self) -> u32 {
        crc32fast::hash(&self.payload)
    }

    /// True when the payload still matches the checksum it was written with.
    pub fn is_intact(&self) -> bool {
        self.actual_checksum() == self.checksum
    }
}

/// Pool-level self-healing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelfHeal {
    #[default]
    #[serde(alias = "rebuild")]
    Enabled,
    #[serde(alias = "exclude")]
    Disabled,
}

impl SelfHeal {
    pub fn is_enabled(&self) -> bool {
        matches!(self, SelfHeal::Enabled)
    }
}

impl std::fmt::Display for SelfHeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelfHeal::Enabled => write!(f, "enabled"),
            SelfHeal::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for SelfHeal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "rebuild" | "on" => Ok(SelfHeal::Enabled),
            "disabled" | "exclude" | "off" => Ok(SelfHeal::Disabled),
            other => Err(Error::Config(format!("unknown self_heal value: {}", other))),
        }
    }
}

// =============================================================================
// Shard Store Port
// =============================================================================

/// Per-store statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Shards currently stored
    pub shard_count: u64,
    /// Payload bytes currently stored
    pub total_bytes: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// Port for per-target shard persistence, keyed by (object id, shard index).
///
/// `put` overwrites an existing key and must be durable before returning.
/// A reader must observe either the previous record or the new one, never a
/// partially written record.
#[async_trait]
pub trait ShardStore: Send + Sync {
    /// Persist a shard record.
    async fn put(&self, record: &ShardRecord) -> Result<()>;

    /// Fetch a shard record, or `Error::NotFound`.
    async fn get(&self, key: &ShardKey) -> Result<ShardRecord>;

    /// Remove a shard. Returns whether anything was removed.
    async fn delete(&self, key: &ShardKey) -> Result<bool>;

    /// All keys currently held.
    async fn keys(&self) -> Result<Vec<ShardKey>>;

    /// Store statistics.
    fn stats(&self) -> StoreStats;
}

/// Opens the shard store backing a target.
pub trait StoreFactory: Send + Sync {
    fn open(&self, target: TargetId) -> Result<Arc<dyn ShardStore>>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

use super::events::DomainEvent;

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a domain event.
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_id_display() {
        assert_eq!(TargetId::new(3).to_string(), "rank-3");
        assert_eq!(TargetId::from(7).rank(), 7);
    }

    #[test]
    fn test_object_id_parse_roundtrip() {
        let id = ObjectId::new();
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_shard_kind_for_index() {
        assert_eq!(ShardKind::for_index(0, 2), ShardKind::Data);
        assert_eq!(ShardKind::for_index(1, 2), ShardKind::Data);
        assert_eq!(ShardKind::for_index(2, 2), ShardKind::Parity);
        assert_eq!(ShardKind::from_byte(ShardKind::Parity.to_byte()), Some(ShardKind::Parity));
        assert_eq!(ShardKind::from_byte(9), None);
    }

    #[test]
    fn test_shard_record_integrity() {
        let payload = Bytes::from_static(b"shard bytes");
        let mut record = ShardRecord {
            object_id: ObjectId::new(),
            shard_index: 0,
            kind: ShardKind::Data,
            checksum: crc32fast::hash(&payload),
            payload,
        };
        assert!(record.is_intact());

        record.payload = Bytes::from_static(b"shard bytez");
        assert!(!record.is_intact());
    }

    #[test]
    fn test_self_heal_parse() {
        assert_eq!("exclude".parse::<SelfHeal>().unwrap(), SelfHeal::Disabled);
        assert_eq!("Enabled".parse::<SelfHeal>().unwrap(), SelfHeal::Enabled);
        assert!("sometimes".parse::<SelfHeal>().is_err());
        assert!(SelfHeal::default().is_enabled());
    }

    #[test]
    fn test_self_heal_yaml_alias() {
        let policy: SelfHeal = serde_yaml::from_str("exclude").unwrap();
        assert_eq!(policy, SelfHeal::Disabled);
    }
}
