//! healpool - Erasure-Coded Object Pools with Self-Healing Rebuild
//!
//! Objects are split into data shards, protected by Reed-Solomon parity
//! shards and spread over the targets (server ranks) of a pool. When a
//! target fails, the pool either rebuilds the lost shards onto surviving
//! targets or, with self-heal disabled, keeps serving degraded reads until
//! the policy is switched back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           PoolManager                             │
//! │   pools ─ containers ─ write / read / fail_target / destroy       │
//! ├──────────────┬──────────────┬───────────────┬────────────────────┤
//! │  ec          │  placement   │  targets      │  rebuild           │
//! │  (encode,    │  (HRW shard  │  (health,     │  (task table,      │
//! │   decode)    │   → target)  │   stores)     │   state machine)   │
//! ├──────────────┴──────────────┴───────────────┴────────────────────┤
//! │  adapters: file / in-memory shard stores, event publishers        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Shard stores and event publishers implementing domain ports
//! - [`config`] - YAML configuration
//! - [`domain`] - Identifiers, shard records, ports and domain events
//! - [`ec`] - Object classes and the Reed-Solomon codec
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus counters
//! - [`placement`] - Shard placement
//! - [`pool`] - Pools, containers and the object read/write path
//! - [`rebuild`] - Rebuild controller
//! - [`scenario`] - End-to-end failure scenario runner
//! - [`targets`] - Target registry

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ec;
pub mod error;
pub mod metrics;
pub mod object_lock;
pub mod placement;
pub mod pool;
pub mod rebuild;
pub mod scenario;
pub mod targets;

// Re-export commonly used types
pub use config::Config;
pub use domain::ports::{ContainerId, ObjectId, PoolId, SelfHeal, TargetId};
pub use ec::ObjectClass;
pub use error::{Error, Result};
pub use pool::{ContainerProps, PoolManager, PoolSettings, PoolSpace, Teardown};
pub use rebuild::{RebuildController, RebuildState};
pub use scenario::{ScenarioReport, ScenarioRunner};
