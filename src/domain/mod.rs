//! Domain Layer
//!
//! Value objects, ports and events shared by the storage components.
//!
//! - **Ports** (`ports.rs`) - identifiers, shard records and the trait
//!   abstractions for shard stores and event publishing
//! - **Events** (`events.rs`) - domain events for audit and observation

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    ContainerId, EventPublisher, ObjectId, PoolId, SelfHeal, ShardKey, ShardKind, ShardRecord,
    ShardStore, StoreFactory, StoreStats, TargetId,
};
