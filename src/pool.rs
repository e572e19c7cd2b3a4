//! Pool and Container Layer
//!
//! `PoolManager` is the boundary a test driver talks to: it creates pools
//! over targets and containers inside pools, writes and reads objects, fails
//! targets on demand and tears everything down again.
//!
//! ```text
//!  write ──▶ place ──▶ encode ──▶ put shards ──▶ record layout
//!  read  ──▶ layout ──▶ fetch shards (timeout, checksum) ──▶ decode
//!  fail  ──▶ mark target failed ──▶ RebuildController
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::domain::events::DomainEvent;
use crate::domain::ports::{
    ContainerId, EventPublisher, ObjectId, PoolId, SelfHeal, ShardKey, ShardRecord,
    StoreFactory, TargetId,
};
use crate::ec::{EcDecoder, EcEncoder, ObjectClass, ShardPayload};
use crate::error::{Error, Result};
use crate::metrics::StoreMetrics;
use crate::object_lock::ObjectLocks;
use crate::placement::{ObjectLayout, PlacementMap};
use crate::rebuild::{RebuildConfig, RebuildController, RebuildEvent, RebuildState};
use crate::targets::{ShardFetch, TargetRegistry, TargetState};

/// Container properties fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerProps {
    /// Shard losses every object in the container must survive
    pub redundancy_factor: usize,
    /// Class used by `write_default`
    pub object_class: Option<ObjectClass>,
}

impl ContainerProps {
    /// Properties matching a class: redundancy factor equal to its parity.
    pub fn for_class(class: ObjectClass) -> Self {
        Self {
            redundancy_factor: class.parity_shards(),
            object_class: Some(class),
        }
    }
}

/// How to treat rebuilds still referencing a container being destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Wait for them to finish, up to the teardown timeout, then abort.
    Wait,
    /// Abort them immediately.
    Force,
}

/// Space used on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSpace {
    pub target: TargetId,
    pub state: TargetState,
    /// Shards the placement map assigns to the target
    pub shards: usize,
    /// Payload bytes held by the target's store; zero once failed
    pub bytes: u64,
}

/// Space used across a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSpace {
    pub pool_id: PoolId,
    pub targets: Vec<TargetSpace>,
}

impl PoolSpace {
    pub fn total_shards(&self) -> usize {
        self.targets.iter().map(|t| t.shards).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.targets.iter().map(|t| t.bytes).sum()
    }
}

impl std::fmt::Display for PoolSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Pool {}", self.pool_id)?;
        for t in &self.targets {
            writeln!(
                f,
                "  {:<8} {:<7} shards={:<6} bytes={}",
                t.target.to_string(),
                format!("{:?}", t.state),
                t.shards,
                t.bytes
            )?;
        }
        write!(
            f,
            "  total            shards={:<6} bytes={}",
            self.total_shards(),
            self.total_bytes()
        )
    }
}

/// Tunables of a `PoolManager`.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub rebuild: RebuildConfig,
    /// Upper bound on `Teardown::Wait`
    pub teardown_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            rebuild: RebuildConfig::default(),
            teardown_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            rebuild: config.rebuild_config()?,
            teardown_timeout: config.teardown_timeout()?,
        })
    }
}

#[derive(Debug, Default)]
struct PoolEntry {
    containers: BTreeSet<ContainerId>,
}

#[derive(Debug, Clone, Copy)]
struct ContainerEntry {
    pool_id: PoolId,
    props: ContainerProps,
}

/// Pools, containers and objects over a set of targets.
pub struct PoolManager {
    placement: Arc<PlacementMap>,
    targets: Arc<TargetRegistry>,
    locks: Arc<ObjectLocks>,
    controller: Arc<RebuildController>,
    publisher: Arc<dyn EventPublisher>,
    metrics: StoreMetrics,
    pools: DashMap<PoolId, PoolEntry>,
    containers: DashMap<ContainerId, ContainerEntry>,
    settings: PoolSettings,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("pools", &self.pools.len())
            .field("containers", &self.containers.len())
            .field("objects", &self.placement.len())
            .finish()
    }
}

impl PoolManager {
    pub fn new(
        factory: Arc<dyn StoreFactory>,
        publisher: Arc<dyn EventPublisher>,
        settings: PoolSettings,
    ) -> Result<Self> {
        let placement = Arc::new(PlacementMap::new());
        let targets = Arc::new(TargetRegistry::new(factory));
        let locks = Arc::new(ObjectLocks::new());
        let metrics = StoreMetrics::new()?;
        let controller = RebuildController::new(
            settings.rebuild.clone(),
            placement.clone(),
            targets.clone(),
            locks.clone(),
            publisher.clone(),
            metrics.clone(),
        );

        Ok(Self {
            placement,
            targets,
            locks,
            controller,
            publisher,
            metrics,
            pools: DashMap::new(),
            containers: DashMap::new(),
            settings,
        })
    }

    pub fn controller(&self) -> &Arc<RebuildController> {
        &self.controller
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    pub fn placement(&self) -> &PlacementMap {
        &self.placement
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    async fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            warn!(error = %e, "Failed to publish event");
        }
    }

    // =========================================================================
    // Pools
    // =========================================================================

    /// Create a pool over `targets`. The pool starts with self-heal enabled.
    #[instrument(skip(self))]
    pub async fn create_pool(&self, targets: &[TargetId]) -> Result<PoolId> {
        let unique: BTreeSet<TargetId> = targets.iter().copied().collect();
        if unique.is_empty() {
            return Err(Error::Config("a pool needs at least one target".to_string()));
        }
        if let Some(taken) = unique.iter().find(|t| self.targets.info(**t).is_some()) {
            return Err(Error::PolicyViolation(format!("{} already belongs to a pool", taken)));
        }

        let pool_id = PoolId::new();
        for target in &unique {
            self.targets.add(pool_id, *target)?;
        }
        self.pools.insert(pool_id, PoolEntry::default());
        self.controller.register_pool(pool_id, SelfHeal::Enabled);

        info!(%pool_id, targets = unique.len(), "Pool created");
        self.publish(DomainEvent::PoolCreated {
            pool_id,
            targets: unique.into_iter().collect(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(pool_id)
    }

    /// Change a pool's self-heal policy and apply it to pending rebuilds.
    #[instrument(skip(self))]
    pub async fn set_policy(&self, pool_id: PoolId, self_heal: SelfHeal) -> Result<()> {
        self.ensure_pool(pool_id)?;
        self.controller
            .handle_event(RebuildEvent::PolicyChanged { pool_id, self_heal })
            .await?;
        self.publish(DomainEvent::policy_changed(pool_id, self_heal)).await;
        Ok(())
    }

    pub fn policy(&self, pool_id: PoolId) -> Result<SelfHeal> {
        self.ensure_pool(pool_id)?;
        Ok(self.controller.policy(pool_id))
    }

    /// Add replacement or extension targets to a pool.
    #[instrument(skip(self))]
    pub async fn add_targets(&self, pool_id: PoolId, targets: &[TargetId]) -> Result<()> {
        self.ensure_pool(pool_id)?;
        for target in targets {
            self.targets.add(pool_id, *target)?;
            self.publish(DomainEvent::TargetAdded {
                pool_id,
                target: *target,
                timestamp: Utc::now(),
            })
            .await;
        }
        Ok(())
    }

    /// Fail a target of the pool. Returns the number of objects that lost a
    /// shard.
    #[instrument(skip(self))]
    pub async fn fail_target(&self, pool_id: PoolId, target: TargetId) -> Result<usize> {
        self.ensure_pool(pool_id)?;
        match self.targets.info(target) {
            Some(info) if info.pool_id == pool_id => {}
            _ => return Err(Error::not_found("target", format!("{} in pool {}", target, pool_id))),
        }

        if !self.targets.mark_failed(target)? {
            debug!(%target, "Target already failed");
            return Ok(0);
        }

        let affected = self
            .placement
            .objects_on_target(target)
            .into_iter()
            .filter(|(id, _)| {
                self.placement
                    .layout(*id)
                    .map(|l| l.pool_id == pool_id)
                    .unwrap_or(false)
            })
            .count();
        self.metrics.targets_failed.inc();
        warn!(%pool_id, %target, affected, "Target failed");
        self.publish(DomainEvent::target_failed(pool_id, target, affected))
            .await;

        self.controller
            .handle_event(RebuildEvent::TargetFailed { pool_id, target })
            .await?;
        Ok(affected)
    }

    /// Per-target shard counts and bytes.
    pub fn pool_space(&self, pool_id: PoolId) -> Result<PoolSpace> {
        self.ensure_pool(pool_id)?;
        let placed = self.placement.shards_by_target(pool_id);

        let targets = self
            .targets
            .pool_targets(pool_id)
            .into_iter()
            .map(|target| {
                let state = self
                    .targets
                    .info(target)
                    .map(|i| i.state)
                    .unwrap_or(TargetState::Failed);
                let bytes = self
                    .targets
                    .store(target)
                    .map(|s| s.stats().total_bytes)
                    .unwrap_or(0);
                TargetSpace {
                    target,
                    state,
                    shards: placed.get(&target).map(|k| k.len()).unwrap_or(0),
                    bytes,
                }
            })
            .collect();

        Ok(PoolSpace { pool_id, targets })
    }

    /// Destroy every container of the pool, then the pool itself.
    #[instrument(skip(self))]
    pub async fn destroy_pool(&self, pool_id: PoolId, teardown: Teardown) -> Result<()> {
        let containers: Vec<ContainerId> = self
            .pools
            .get(&pool_id)
            .map(|p| p.containers.iter().copied().collect())
            .ok_or_else(|| Error::not_found("pool", pool_id))?;

        for container_id in containers {
            self.destroy_container(container_id, teardown).await?;
        }

        self.controller.unregister_pool(pool_id);
        let removed = self.targets.remove_pool(pool_id);
        self.pools.remove(&pool_id);
        info!(%pool_id, targets = removed, "Pool destroyed");
        self.publish(DomainEvent::PoolDestroyed {
            pool_id,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    fn ensure_pool(&self, pool_id: PoolId) -> Result<()> {
        if self.pools.contains_key(&pool_id) {
            Ok(())
        } else {
            Err(Error::not_found("pool", pool_id))
        }
    }

    // =========================================================================
    // Containers
    // =========================================================================

    /// Create a container. The redundancy factor must stay below the pool's
    /// target count and within the default class' parity.
    #[instrument(skip(self))]
    pub async fn create_container(
        &self,
        pool_id: PoolId,
        props: ContainerProps,
    ) -> Result<ContainerId> {
        self.ensure_pool(pool_id)?;

        let target_count = self.targets.pool_targets(pool_id).len();
        if props.redundancy_factor >= target_count {
            return Err(Error::PolicyViolation(format!(
                "redundancy factor {} needs more than {} targets",
                props.redundancy_factor, target_count
            )));
        }
        if let Some(class) = props.object_class {
            check_redundancy(props.redundancy_factor, class)?;
        }

        let container_id = ContainerId::new();
        self.containers
            .insert(container_id, ContainerEntry { pool_id, props });
        if let Some(mut pool) = self.pools.get_mut(&pool_id) {
            pool.containers.insert(container_id);
        }

        info!(%pool_id, %container_id, rf = props.redundancy_factor, "Container created");
        self.publish(DomainEvent::ContainerCreated {
            pool_id,
            container_id,
            redundancy_factor: props.redundancy_factor,
            timestamp: Utc::now(),
        })
        .await;
        Ok(container_id)
    }

    pub fn container_props(&self, container_id: ContainerId) -> Result<ContainerProps> {
        self.container(container_id).map(|c| c.props)
    }

    pub fn objects(&self, container_id: ContainerId) -> Result<Vec<ObjectId>> {
        self.container(container_id)?;
        Ok(self.placement.objects_in_container(container_id))
    }

    fn container(&self, container_id: ContainerId) -> Result<ContainerEntry> {
        self.containers
            .get(&container_id)
            .map(|c| *c)
            .ok_or_else(|| Error::not_found("container", container_id))
    }

    /// Destroy a container and every object in it.
    ///
    /// Rebuilds still running for its objects are waited for or aborted
    /// according to `teardown`; aborted tasks are recorded as `Failed`.
    #[instrument(skip(self))]
    pub async fn destroy_container(
        &self,
        container_id: ContainerId,
        teardown: Teardown,
    ) -> Result<()> {
        let entry = self.container(container_id)?;
        let objects = self.placement.objects_in_container(container_id);

        if teardown == Teardown::Wait
            && !self
                .controller
                .wait_terminal(&objects, self.settings.teardown_timeout)
                .await
        {
            warn!(
                %container_id,
                timeout = ?self.settings.teardown_timeout,
                "Rebuilds did not finish before teardown timeout"
            );
        }
        let aborted = self
            .controller
            .abort(&objects, &format!("container {} destroyed", container_id))
            .await;

        for object_id in &objects {
            let token = self.locks.lock(*object_id).await;
            if let Some(layout) = self.placement.remove(*object_id) {
                self.delete_shards(&layout).await;
            }
            drop(token);
            self.locks.forget(*object_id);
        }
        self.controller.forget_done(&objects);

        self.containers.remove(&container_id);
        if let Some(mut pool) = self.pools.get_mut(&entry.pool_id) {
            pool.containers.remove(&container_id);
        }

        info!(%container_id, objects = objects.len(), aborted, "Container destroyed");
        self.publish(DomainEvent::ContainerDestroyed {
            container_id,
            objects: objects.len(),
            aborted_tasks: aborted,
            timestamp: Utc::now(),
        })
        .await;
        Ok(())
    }

    async fn delete_shards(&self, layout: &ObjectLayout) {
        for (index, target) in layout.targets.iter().enumerate() {
            let Ok(store) = self.targets.any_store(*target) else {
                continue;
            };
            if let Err(e) = store.delete(&ShardKey::new(layout.object_id, index)).await {
                warn!(object_id = %layout.object_id, shard_index = index, %target, error = %e, "Failed to delete shard");
            }
        }
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Encode `data` with `class` and persist its shards.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write(
        &self,
        container_id: ContainerId,
        data: &[u8],
        class: ObjectClass,
    ) -> Result<ObjectId> {
        let container = self.container(container_id)?;
        check_redundancy(container.props.redundancy_factor, class)?;

        let object_id = ObjectId::new();
        let token = self.locks.lock(object_id).await;

        let live = self.targets.live_targets(container.pool_id);
        let placed = self.placement.place(object_id, class, &live)?;
        let encoded = EcEncoder::new(class)?.encode(data)?;

        let layout = ObjectLayout {
            object_id,
            pool_id: container.pool_id,
            container_id,
            class,
            original_len: data.len(),
            shard_size: encoded.shard_size,
            checksums: encoded.checksums(),
            targets: placed,
        };

        let puts = encoded.shards.iter().zip(&layout.targets).map(|(shard, target)| {
            let record = ShardRecord {
                object_id,
                shard_index: shard.index,
                kind: shard.kind,
                checksum: shard.checksum,
                payload: shard.data.clone(),
            };
            let store = self.targets.store(*target);
            async move { store?.put(&record).await }
        });

        if let Err(e) = try_join_all(puts).await {
            warn!(%object_id, error = %e, "Write failed, removing partial shards");
            self.delete_shards(&layout).await;
            drop(token);
            self.locks.forget(object_id);
            return Err(e);
        }

        self.placement.record(layout);
        self.metrics.objects_written.inc();
        self.metrics.bytes_written.inc_by(data.len() as u64);
        debug!(%object_id, "Object written");

        self.publish(DomainEvent::ObjectWritten {
            container_id,
            object_id,
            object_class: class.to_string(),
            size_bytes: data.len(),
            timestamp: Utc::now(),
        })
        .await;
        Ok(object_id)
    }

    /// Write with the container's default class.
    pub async fn write_default(&self, container_id: ContainerId, data: &[u8]) -> Result<ObjectId> {
        let class = self
            .container(container_id)?
            .props
            .object_class
            .ok_or_else(|| {
                Error::PolicyViolation(format!(
                    "container {} has no default object class",
                    container_id
                ))
            })?;
        self.write(container_id, data, class).await
    }

    /// Read an object back.
    ///
    /// Unavailable, slow and corrupt shards are left out; the object decodes
    /// from the remaining ones or the read fails. A read never returns bytes
    /// that differ from what was written.
    #[instrument(skip(self))]
    pub async fn read(&self, container_id: ContainerId, object_id: ObjectId) -> Result<Vec<u8>> {
        self.container(container_id)?;
        let layout = self
            .placement
            .layout(object_id)
            .filter(|l| l.container_id == container_id)
            .ok_or_else(|| Error::not_found("object", object_id))?;

        let timeout = self.settings.rebuild.shard_fetch_timeout;
        let fetches = layout.targets.iter().enumerate().map(|(index, target)| {
            self.targets
                .fetch(*target, ShardKey::new(object_id, index), timeout)
        });
        let fetched = join_all(fetches).await;

        let mut slots: Vec<Option<ShardPayload>> = Vec::with_capacity(fetched.len());
        let mut missing = Vec::new();
        let mut corrupt = Vec::new();
        for (index, fetch) in fetched.into_iter().enumerate() {
            let expected = layout.checksums[index];
            match fetch {
                ShardFetch::Found(record) if record.is_intact() && record.checksum == expected => {
                    slots.push(Some(ShardPayload {
                        index,
                        kind: record.kind,
                        data: record.payload,
                        checksum: record.checksum,
                    }));
                }
                ShardFetch::Found(record) => {
                    corrupt.push((index, expected, record.actual_checksum()));
                    missing.push(index);
                    slots.push(None);
                }
                ShardFetch::Unavailable | ShardFetch::TimedOut => {
                    missing.push(index);
                    slots.push(None);
                }
            }
        }

        for &(index, _, _) in &corrupt {
            self.report_corruption(&layout, index).await;
        }

        let available = slots.iter().filter(|s| s.is_some()).count();
        let required = layout.class.data_shards();
        if available < required {
            self.metrics.record_read("failed");
            if let Some(&(shard_index, expected, actual)) = corrupt.first() {
                return Err(Error::CorruptShard {
                    shard_index,
                    expected,
                    actual,
                });
            }
            return Err(Error::InsufficientShards {
                available,
                required,
            });
        }

        let data = EcDecoder::new(layout.class)?.decode(&slots, layout.original_len)?;

        if missing.is_empty() {
            self.metrics.record_read("ok");
        } else {
            self.metrics.record_read("degraded");
            debug!(%object_id, ?missing, "Degraded read");
            self.publish(DomainEvent::DegradedRead {
                object_id,
                missing_shards: missing,
                timestamp: Utc::now(),
            })
            .await;
        }

        Ok(data)
    }

    async fn report_corruption(&self, layout: &ObjectLayout, shard_index: usize) {
        let target = layout.targets[shard_index];
        warn!(object_id = %layout.object_id, shard_index, %target, "Corrupt shard detected");
        self.metrics.corrupt_shards.inc();
        self.publish(DomainEvent::CorruptShardDetected {
            object_id: layout.object_id,
            shard_index,
            target,
            timestamp: Utc::now(),
        })
        .await;

        if !self.controller.policy(layout.pool_id).is_enabled() {
            return;
        }
        let event = RebuildEvent::CorruptShard {
            pool_id: layout.pool_id,
            object_id: layout.object_id,
            shard_index,
        };
        if let Err(e) = self.controller.handle_event(event).await {
            warn!(object_id = %layout.object_id, error = %e, "Failed to queue shard repair");
        }
    }

    /// Rebuild state of an object, `Idle` if it never needed one.
    pub fn rebuild_status(&self, object_id: ObjectId) -> RebuildState {
        self.controller.status(object_id)
    }
}

fn check_redundancy(redundancy_factor: usize, class: ObjectClass) -> Result<()> {
    if redundancy_factor > class.parity_shards() {
        return Err(Error::PolicyViolation(format!(
            "redundancy factor {} exceeds {} parity of {}",
            redundancy_factor,
            class.parity_shards(),
            class
        )));
    }
    Ok(())
}
