//! Self-healing rebuild.
//!
//! When a target fails, every object with a shard on it gets a rebuild task.
//! The pool's self-heal policy decides whether the task runs: enabled pools
//! reconstruct the lost shards onto replacement targets, disabled pools hold
//! the task `Suspended` until the policy is switched back.
//!
//! ```text
//!   TargetFailed ──┐
//!   CorruptShard ──┼──▶ RebuildController ──▶ run_cycle ──▶ fetch ─▶ decode ─▶ put ─▶ verify ─▶ relocate
//!  PolicyChanged ──┘        (task table)
//! ```

mod controller;
mod task;

pub use controller::RebuildController;
pub use task::{RebuildConfig, RebuildEvent, RebuildState, RebuildTask};
