//! Domain Events
//!
//! Immutable records of significant occurrences in the pools: lifecycle of
//! pools, containers and objects, target failures, rebuild transitions and
//! detected corruption.
//!
//! Events are used for audit logging and for observing rebuild progress in
//! tests without reaching into controller internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::{ContainerId, ObjectId, PoolId, SelfHeal, TargetId};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Pool / Container Events
    // =========================================================================
    /// A pool was created over a set of targets.
    PoolCreated {
        pool_id: PoolId,
        targets: Vec<TargetId>,
        timestamp: DateTime<Utc>,
    },

    /// A pool's self-heal policy changed.
    PolicyChanged {
        pool_id: PoolId,
        self_heal: SelfHeal,
        timestamp: DateTime<Utc>,
    },

    /// A pool was destroyed.
    PoolDestroyed {
        pool_id: PoolId,
        timestamp: DateTime<Utc>,
    },

    /// A container was created.
    ContainerCreated {
        pool_id: PoolId,
        container_id: ContainerId,
        redundancy_factor: usize,
        timestamp: DateTime<Utc>,
    },

    /// A container was destroyed.
    ContainerDestroyed {
        container_id: ContainerId,
        objects: usize,
        aborted_tasks: usize,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Object Events
    // =========================================================================
    /// An object was encoded and persisted.
    ObjectWritten {
        container_id: ContainerId,
        object_id: ObjectId,
        object_class: String,
        size_bytes: usize,
        timestamp: DateTime<Utc>,
    },

    /// A read had to reconstruct data from parity.
    DegradedRead {
        object_id: ObjectId,
        missing_shards: Vec<usize>,
        timestamp: DateTime<Utc>,
    },

    /// A shard failed checksum validation.
    CorruptShardDetected {
        object_id: ObjectId,
        shard_index: usize,
        target: TargetId,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Fault / Rebuild Events
    // =========================================================================
    /// A target was marked failed.
    TargetFailed {
        pool_id: PoolId,
        target: TargetId,
        affected_objects: usize,
        timestamp: DateTime<Utc>,
    },

    /// A target joined a pool after creation.
    TargetAdded {
        pool_id: PoolId,
        target: TargetId,
        timestamp: DateTime<Utc>,
    },

    /// Rebuild of an object was held back by a disabled policy.
    RebuildSuspended {
        object_id: ObjectId,
        missing_shards: Vec<usize>,
        timestamp: DateTime<Utc>,
    },

    /// Rebuild of an object started (or resumed).
    RebuildStarted {
        object_id: ObjectId,
        missing_shards: Vec<usize>,
        timestamp: DateTime<Utc>,
    },

    /// A lost shard was rewritten on a replacement target.
    ShardReconstructed {
        object_id: ObjectId,
        shard_index: usize,
        target: TargetId,
        timestamp: DateTime<Utc>,
    },

    /// Rebuild of an object completed and verified.
    RebuildCompleted {
        object_id: ObjectId,
        shards_rebuilt: usize,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// Rebuild of an object failed or was aborted.
    RebuildFailed {
        object_id: ObjectId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::PoolCreated { .. } => "PoolCreated",
            DomainEvent::PolicyChanged { .. } => "PolicyChanged",
            DomainEvent::PoolDestroyed { .. } => "PoolDestroyed",
            DomainEvent::ContainerCreated { .. } => "ContainerCreated",
            DomainEvent::ContainerDestroyed { .. } => "ContainerDestroyed",
            DomainEvent::ObjectWritten { .. } => "ObjectWritten",
            DomainEvent::DegradedRead { .. } => "DegradedRead",
            DomainEvent::CorruptShardDetected { .. } => "CorruptShardDetected",
            DomainEvent::TargetFailed { .. } => "TargetFailed",
            DomainEvent::TargetAdded { .. } => "TargetAdded",
            DomainEvent::RebuildSuspended { .. } => "RebuildSuspended",
            DomainEvent::RebuildStarted { .. } => "RebuildStarted",
            DomainEvent::ShardReconstructed { .. } => "ShardReconstructed",
            DomainEvent::RebuildCompleted { .. } => "RebuildCompleted",
            DomainEvent::RebuildFailed { .. } => "RebuildFailed",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::PoolCreated { timestamp, .. }
            | DomainEvent::PolicyChanged { timestamp, .. }
            | DomainEvent::PoolDestroyed { timestamp, .. }
            | DomainEvent::ContainerCreated { timestamp, .. }
            | DomainEvent::ContainerDestroyed { timestamp, .. }
            | DomainEvent::ObjectWritten { timestamp, .. }
            | DomainEvent::DegradedRead { timestamp, .. }
            | DomainEvent::CorruptShardDetected { timestamp, .. }
            | DomainEvent::TargetFailed { timestamp, .. }
            | DomainEvent::TargetAdded { timestamp, .. }
            | DomainEvent::RebuildSuspended { timestamp, .. }
            | DomainEvent::RebuildStarted { timestamp, .. }
            | DomainEvent::ShardReconstructed { timestamp, .. }
            | DomainEvent::RebuildCompleted { timestamp, .. }
            | DomainEvent::RebuildFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Object the event concerns, if any.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            DomainEvent::ObjectWritten { object_id, .. }
            | DomainEvent::DegradedRead { object_id, .. }
            | DomainEvent::CorruptShardDetected { object_id, .. }
            | DomainEvent::RebuildSuspended { object_id, .. }
            | DomainEvent::RebuildStarted { object_id, .. }
            | DomainEvent::ShardReconstructed { object_id, .. }
            | DomainEvent::RebuildCompleted { object_id, .. }
            | DomainEvent::RebuildFailed { object_id, .. } => Some(*object_id),
            _ => None,
        }
    }

    // =========================================================================
    // Factory Methods
    // =========================================================================

    pub fn target_failed(pool_id: PoolId, target: TargetId, affected_objects: usize) -> Self {
        DomainEvent::TargetFailed {
            pool_id,
            target,
            affected_objects,
            timestamp: Utc::now(),
        }
    }

    pub fn policy_changed(pool_id: PoolId, self_heal: SelfHeal) -> Self {
        DomainEvent::PolicyChanged {
            pool_id,
            self_heal,
            timestamp: Utc::now(),
        }
    }

    pub fn rebuild_failed(object_id: ObjectId, reason: impl Into<String>) -> Self {
        DomainEvent::RebuildFailed {
            object_id,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_object() {
        let object_id = ObjectId::new();
        let event = DomainEvent::rebuild_failed(object_id, "too many missing shards");

        assert_eq!(event.event_type(), "RebuildFailed");
        assert_eq!(event.object_id(), Some(object_id));

        let event = DomainEvent::target_failed(PoolId::new(), TargetId::new(1), 4);
        assert_eq!(event.event_type(), "TargetFailed");
        assert_eq!(event.object_id(), None);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = DomainEvent::policy_changed(PoolId::new(), SelfHeal::Disabled);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "PolicyChanged");
        assert_eq!(json["self_heal"], "disabled");
    }
}
