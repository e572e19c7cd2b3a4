//! Rebuild task model.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::ports::{ObjectId, PoolId, SelfHeal, TargetId};
use crate::ec::ObjectClass;

/// Lifecycle of a per-object rebuild.
///
/// ```text
///  Idle ─▶ Detecting ─┬─▶ Reconstructing ─▶ Verifying ─▶ Done
///                     │        ▲    │            │
///                     │        │    ▼            │ (checksum mismatch)
///                     ├─▶ Suspended ◀────────────┘
///                     └─▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebuildState {
    /// No rebuild was ever needed.
    Idle,
    /// Evaluating which shards are lost and whether they are recoverable.
    Detecting,
    Reconstructing,
    Verifying,
    Done,
    /// Held back by a disabled self-heal policy.
    Suspended,
    /// Unrecoverable, out of retries or aborted. Stays until cleared.
    Failed,
}

impl RebuildState {
    /// `Done` and `Failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RebuildState::Done | RebuildState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RebuildState::Idle => "Idle",
            RebuildState::Detecting => "Detecting",
            RebuildState::Reconstructing => "Reconstructing",
            RebuildState::Verifying => "Verifying",
            RebuildState::Done => "Done",
            RebuildState::Suspended => "Suspended",
            RebuildState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for RebuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rebuild of one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildTask {
    pub task_id: Uuid,
    pub pool_id: PoolId,
    pub object_id: ObjectId,
    pub class: ObjectClass,
    /// Shard indices still to rebuild
    pub missing: BTreeSet<usize>,
    /// Failed targets that contributed missing shards
    pub failed_targets: BTreeSet<TargetId>,
    pub state: RebuildState,
    /// Execution attempts since the task last entered `Detecting`
    pub attempts: u32,
    /// Order of the failure that opened this task; lower runs first
    pub failure_seq: u64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// An executor currently holds this task
    #[serde(skip)]
    pub(crate) in_flight: bool,
}

impl RebuildTask {
    pub(crate) fn new(
        pool_id: PoolId,
        object_id: ObjectId,
        class: ObjectClass,
        failure_seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            pool_id,
            object_id,
            class,
            missing: BTreeSet::new(),
            failed_targets: BTreeSet::new(),
            state: RebuildState::Detecting,
            attempts: 0,
            failure_seq,
            last_error: None,
            created_at: now,
            updated_at: now,
            in_flight: false,
        }
    }

    /// Whether the merged loss still fits within the class' parity.
    pub fn recoverable(&self) -> bool {
        self.class.can_recover(self.missing.len())
    }

    pub fn missing_shards(&self) -> Vec<usize> {
        self.missing.iter().copied().collect()
    }

    pub(crate) fn transition(&mut self, state: RebuildState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Reopen a finished task for a fresh loss.
    pub(crate) fn reopen(&mut self, failure_seq: u64) {
        self.missing.clear();
        self.attempts = 0;
        self.failure_seq = failure_seq;
        self.last_error = None;
        self.transition(RebuildState::Detecting);
    }
}

/// Events the controller reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildEvent {
    TargetFailed { pool_id: PoolId, target: TargetId },
    PolicyChanged { pool_id: PoolId, self_heal: SelfHeal },
    CorruptShard {
        pool_id: PoolId,
        object_id: ObjectId,
        shard_index: usize,
    },
}

/// Tuning for the rebuild controller.
#[derive(Debug, Clone)]
pub struct RebuildConfig {
    /// Execution attempts before a task is marked `Failed`
    pub max_retries: u32,
    /// Upper bound on a single shard fetch
    pub shard_fetch_timeout: Duration,
    /// Interval between background scheduling cycles
    pub cycle_interval: Duration,
    /// Tasks executed per cycle
    pub max_concurrent: usize,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            shard_fetch_timeout: Duration::from_secs(5),
            cycle_interval: Duration::from_millis(500),
            max_concurrent: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RebuildState::Done.is_terminal());
        assert!(RebuildState::Failed.is_terminal());
        assert!(!RebuildState::Suspended.is_terminal());
        assert!(!RebuildState::Idle.is_terminal());
        assert_eq!(RebuildState::Verifying.to_string(), "Verifying");
    }

    #[test]
    fn test_recoverable_tracks_parity() {
        let class = ObjectClass::new(2, 1).unwrap();
        let mut task = RebuildTask::new(PoolId::new(), ObjectId::new(), class, 0);
        assert_eq!(task.state, RebuildState::Detecting);

        task.missing.insert(0);
        assert!(task.recoverable());
        task.missing.insert(2);
        assert!(!task.recoverable());

        task.attempts = 2;
        task.reopen(7);
        assert!(task.missing.is_empty());
        assert_eq!(task.attempts, 0);
        assert_eq!(task.failure_seq, 7);
    }

    #[test]
    fn test_default_config() {
        let config = RebuildConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(config.max_concurrent > 0);
    }
}
