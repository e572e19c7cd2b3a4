//! Placement Map
//!
//! Decides which target holds each shard of an object, and remembers the
//! layout of every written object: class, original length, per-shard
//! checksums and the shard → target mapping.
//!
//! Placement uses rendezvous (highest-random-weight) hashing: every
//! `(object, shard index, target)` triple gets an xxh3 score and each shard
//! takes the best-scoring target not already used by a lower shard index.
//! The result depends only on the object id and the *set* of live targets,
//! so recomputing it is idempotent and independent of target order.

use std::collections::{BTreeMap, BTreeSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::xxh3_64;

use crate::domain::ports::{ContainerId, ObjectId, PoolId, ShardKey, TargetId};
use crate::ec::ObjectClass;
use crate::error::{Error, Result};

/// Layout of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLayout {
    pub object_id: ObjectId,
    pub pool_id: PoolId,
    pub container_id: ContainerId,
    pub class: ObjectClass,
    /// Length of the object before padding
    pub original_len: usize,
    pub shard_size: usize,
    /// CRC32 of every shard, by index
    pub checksums: Vec<u32>,
    /// Target holding every shard, by index
    pub targets: Vec<TargetId>,
}

impl ObjectLayout {
    /// Shard indices held by `target`.
    pub fn shards_on(&self, target: TargetId) -> Vec<usize> {
        self.targets
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == target)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn shard_keys(&self) -> impl Iterator<Item = ShardKey> + '_ {
        (0..self.targets.len()).map(move |i| ShardKey::new(self.object_id, i))
    }
}

fn score(object_id: ObjectId, shard_index: usize, target: TargetId) -> u64 {
    let mut buf = [0u8; 24];
    buf[..16].copy_from_slice(object_id.as_uuid().as_bytes());
    buf[16..20].copy_from_slice(&(shard_index as u32).to_le_bytes());
    buf[20..24].copy_from_slice(&target.rank().to_le_bytes());
    xxh3_64(&buf)
}

/// Best-scoring target for a shard among `candidates`, skipping `excluded`.
/// Ties are broken by rank so the choice never depends on input order.
fn best_target(
    object_id: ObjectId,
    shard_index: usize,
    candidates: &BTreeSet<TargetId>,
    excluded: &BTreeSet<TargetId>,
) -> Option<TargetId> {
    candidates
        .iter()
        .filter(|t| !excluded.contains(t))
        .max_by_key(|t| (score(object_id, shard_index, **t), t.rank()))
        .copied()
}

/// Directory of object layouts plus the placement function.
#[derive(Debug, Default)]
pub struct PlacementMap {
    layouts: DashMap<ObjectId, ObjectLayout>,
}

impl PlacementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose a distinct target for each of the class' shards.
    ///
    /// Index `i` of the result is the target of shard `i`.
    pub fn place(
        &self,
        object_id: ObjectId,
        class: ObjectClass,
        live_targets: &[TargetId],
    ) -> Result<Vec<TargetId>> {
        let candidates: BTreeSet<TargetId> = live_targets.iter().copied().collect();
        let required = class.total_shards();
        if candidates.len() < required {
            return Err(Error::InsufficientTargets {
                available: candidates.len(),
                required,
            });
        }

        let mut used = BTreeSet::new();
        let mut targets = Vec::with_capacity(required);
        for shard_index in 0..required {
            let target = best_target(object_id, shard_index, &candidates, &used).ok_or(
                Error::InsufficientTargets {
                    available: candidates.len(),
                    required,
                },
            )?;
            used.insert(target);
            targets.push(target);
        }

        Ok(targets)
    }

    /// Pick a live target for a rebuilt shard that holds no other shard of
    /// the object.
    pub fn pick_replacement(
        &self,
        object_id: ObjectId,
        shard_index: usize,
        live_targets: &[TargetId],
        occupied: &[TargetId],
    ) -> Result<TargetId> {
        let candidates: BTreeSet<TargetId> = live_targets.iter().copied().collect();
        let excluded: BTreeSet<TargetId> = occupied.iter().copied().collect();

        best_target(object_id, shard_index, &candidates, &excluded).ok_or_else(|| {
            Error::InsufficientTargets {
                available: candidates.difference(&excluded).count(),
                required: 1,
            }
        })
    }

    /// Remember the layout of a written object, replacing any previous one.
    pub fn record(&self, layout: ObjectLayout) {
        debug!(object_id = %layout.object_id, targets = ?layout.targets, "Recorded layout");
        self.layouts.insert(layout.object_id, layout);
    }

    pub fn layout(&self, object_id: ObjectId) -> Option<ObjectLayout> {
        self.layouts.get(&object_id).map(|l| l.clone())
    }

    /// Move a shard to a new target after it was rebuilt there.
    pub fn relocate(
        &self,
        object_id: ObjectId,
        shard_index: usize,
        new_target: TargetId,
    ) -> Result<()> {
        let mut layout = self
            .layouts
            .get_mut(&object_id)
            .ok_or_else(|| Error::not_found("object", object_id))?;

        let slot = layout.targets.get_mut(shard_index).ok_or_else(|| {
            Error::Internal(format!(
                "shard index {} out of range for object {}",
                shard_index, object_id
            ))
        })?;
        debug!(%object_id, shard_index, from = %slot, to = %new_target, "Relocating shard");
        *slot = new_target;
        Ok(())
    }

    pub fn remove(&self, object_id: ObjectId) -> Option<ObjectLayout> {
        self.layouts.remove(&object_id).map(|(_, l)| l)
    }

    /// Objects with at least one shard on `target`, and which shards.
    pub fn objects_on_target(&self, target: TargetId) -> Vec<(ObjectId, Vec<usize>)> {
        let mut found: Vec<(ObjectId, Vec<usize>)> = self
            .layouts
            .iter()
            .filter_map(|entry| {
                let shards = entry.shards_on(target);
                (!shards.is_empty()).then(|| (entry.object_id, shards))
            })
            .collect();
        found.sort_by_key(|(id, _)| *id);
        found
    }

    /// Shard keys of a pool grouped by the target holding them.
    pub fn shards_by_target(&self, pool_id: PoolId) -> BTreeMap<TargetId, Vec<ShardKey>> {
        let mut by_target: BTreeMap<TargetId, Vec<ShardKey>> = BTreeMap::new();
        for entry in self.layouts.iter().filter(|e| e.pool_id == pool_id) {
            for (index, target) in entry.targets.iter().enumerate() {
                by_target
                    .entry(*target)
                    .or_default()
                    .push(ShardKey::new(entry.object_id, index));
            }
        }
        for keys in by_target.values_mut() {
            keys.sort();
        }
        by_target
    }

    /// Objects belonging to a container.
    pub fn objects_in_container(&self, container_id: ContainerId) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .layouts
            .iter()
            .filter(|e| e.container_id == container_id)
            .map(|e| e.object_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}
