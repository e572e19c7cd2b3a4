//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │          ShardStore │ StoreFactory │ EventPublisher         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ FileShardStore │ InMemoryShardStore │ LoggingEventPublisher│ │
//! │  │ FileStoreFactory │ InMemoryStoreFactory │ InMemoryEvents   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod event_publisher;
mod file_store;
mod memory_store;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use file_store::{FileShardStore, FileStoreFactory};
pub use memory_store::{InMemoryShardStore, InMemoryStoreFactory};
