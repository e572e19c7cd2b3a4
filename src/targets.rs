//! Target Registry
//!
//! Tracks every storage target (server rank): the pool it serves, whether it
//! is live, and the shard store bound to it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::ports::{PoolId, ShardKey, ShardRecord, ShardStore, StoreFactory, TargetId};
use crate::error::{Error, Result};

/// Health of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    Live,
    Failed,
}

#[derive(Clone)]
struct TargetEntry {
    pool_id: PoolId,
    state: TargetState,
    store: Arc<dyn ShardStore>,
    failed_at: Option<DateTime<Utc>>,
}

/// Snapshot of a target for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub target: TargetId,
    pub pool_id: PoolId,
    pub state: TargetState,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Result of fetching one shard from its target.
#[derive(Debug)]
pub enum ShardFetch {
    /// The record as stored; integrity is not yet checked.
    Found(ShardRecord),
    /// Target failed or the shard is absent.
    Unavailable,
    /// The fetch exceeded its deadline. Target health is left untouched.
    TimedOut,
}

/// Registry of targets and their stores.
pub struct TargetRegistry {
    factory: Arc<dyn StoreFactory>,
    targets: DashMap<TargetId, TargetEntry>,
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl TargetRegistry {
    pub fn new(factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            factory,
            targets: DashMap::new(),
        }
    }

    /// Open the store for `target` and register it as live in `pool_id`.
    ///
    /// A target can serve a single pool.
    pub fn add(&self, pool_id: PoolId, target: TargetId) -> Result<()> {
        if let Some(existing) = self.targets.get(&target) {
            return Err(Error::PolicyViolation(format!(
                "{} already belongs to pool {}",
                target, existing.pool_id
            )));
        }

        let store = self.factory.open(target)?;
        self.targets.insert(
            target,
            TargetEntry {
                pool_id,
                state: TargetState::Live,
                store,
                failed_at: None,
            },
        );
        info!(%pool_id, %target, "Target added");
        Ok(())
    }

    /// Mark a target failed. Returns false if it was already failed.
    pub fn mark_failed(&self, target: TargetId) -> Result<bool> {
        let mut entry = self
            .targets
            .get_mut(&target)
            .ok_or_else(|| Error::not_found("target", target))?;

        if entry.state == TargetState::Failed {
            return Ok(false);
        }
        entry.state = TargetState::Failed;
        entry.failed_at = Some(Utc::now());
        warn!(pool_id = %entry.pool_id, %target, "Target marked failed");
        Ok(true)
    }

    pub fn is_live(&self, target: TargetId) -> bool {
        self.targets
            .get(&target)
            .map(|e| e.state == TargetState::Live)
            .unwrap_or(false)
    }

    /// Live targets of a pool, in rank order.
    pub fn live_targets(&self, pool_id: PoolId) -> Vec<TargetId> {
        self.collect(pool_id, |e| e.state == TargetState::Live)
    }

    /// All targets of a pool regardless of health, in rank order.
    pub fn pool_targets(&self, pool_id: PoolId) -> Vec<TargetId> {
        self.collect(pool_id, |_| true)
    }

    fn collect(&self, pool_id: PoolId, keep: impl Fn(&TargetEntry) -> bool) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> = self
            .targets
            .iter()
            .filter(|e| e.pool_id == pool_id && keep(e.value()))
            .map(|e| *e.key())
            .collect();
        targets.sort();
        targets
    }

    /// Store bound to a live target.
    pub fn store(&self, target: TargetId) -> Result<Arc<dyn ShardStore>> {
        match self.targets.get(&target) {
            Some(e) if e.state == TargetState::Live => Ok(Arc::clone(&e.store)),
            Some(_) => Err(Error::Internal(format!("{} has failed", target))),
            None => Err(Error::not_found("target", target)),
        }
    }

    /// Store bound to `target` whatever its health. Only for cleanup of
    /// shards left on failed targets.
    pub fn any_store(&self, target: TargetId) -> Result<Arc<dyn ShardStore>> {
        self.targets
            .get(&target)
            .map(|e| Arc::clone(&e.store))
            .ok_or_else(|| Error::not_found("target", target))
    }

    /// Fetch a shard from `target`, giving up after `deadline`.
    pub async fn fetch(&self, target: TargetId, key: ShardKey, deadline: Duration) -> ShardFetch {
        let store = match self.store(target) {
            Ok(store) => store,
            Err(_) => return ShardFetch::Unavailable,
        };

        match tokio::time::timeout(deadline, store.get(&key)).await {
            Ok(Ok(record)) => ShardFetch::Found(record),
            Ok(Err(e)) => {
                debug!(%target, shard = %key, error = %e, "Shard unavailable");
                ShardFetch::Unavailable
            }
            Err(_) => {
                warn!(%target, shard = %key, ?deadline, "Shard fetch timed out");
                ShardFetch::TimedOut
            }
        }
    }

    pub fn info(&self, target: TargetId) -> Option<TargetInfo> {
        self.targets.get(&target).map(|e| TargetInfo {
            target,
            pool_id: e.pool_id,
            state: e.state,
            failed_at: e.failed_at,
        })
    }

    /// Forget every target of a pool. Returns how many were removed.
    pub fn remove_pool(&self, pool_id: PoolId) -> usize {
        let before = self.targets.len();
        self.targets.retain(|_, e| e.pool_id != pool_id);
        before - self.targets.len()
    }
}
