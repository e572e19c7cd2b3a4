//! Per-object mutual exclusion.
//!
//! Writers and rebuild execution hold an object's token for the duration of
//! their shard mutations. Readers never take it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::ports::ObjectId;

/// Lock table keyed by object id.
#[derive(Debug, Default)]
pub struct ObjectLocks {
    locks: DashMap<ObjectId, Arc<Mutex<()>>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the token of `object_id`.
    pub async fn lock(&self, object_id: ObjectId) -> OwnedMutexGuard<()> {
        let token = self
            .locks
            .entry(object_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        token.lock_owned().await
    }

    /// Take the token only if nobody holds it.
    pub fn try_lock(&self, object_id: ObjectId) -> Option<OwnedMutexGuard<()>> {
        let token = self
            .locks
            .entry(object_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        token.try_lock_owned().ok()
    }

    /// Drop the token of a deleted object.
    pub fn forget(&self, object_id: ObjectId) {
        self.locks.remove(&object_id);
    }

    /// Drop every token nobody holds or waits on. Returns how many went.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, token| Arc::strong_count(token) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
