//! Rebuild Scenario Tests
//!
//! Pool-level failure scenarios driven through `PoolManager`:
//! - Rebuild after a target failure with self-heal enabled
//! - Degraded and failed reads with self-heal disabled
//! - Redundancy factor enforcement
//! - Corrupt shards, slow targets, teardown and file-backed stores

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use futures::future::join_all;

use healpool::adapters::{FileStoreFactory, InMemoryEventCollector, InMemoryStoreFactory};
use healpool::domain::{ShardKey, ShardStore, StoreFactory};
use healpool::rebuild::RebuildConfig;
use healpool::{
    ContainerId, ContainerProps, Error, ObjectClass, ObjectId, PoolId, PoolManager, PoolSettings,
    RebuildState, SelfHeal, TargetId, Teardown,
};

// =============================================================================
// Harness
// =============================================================================

struct Pool {
    manager: PoolManager,
    stores: Arc<InMemoryStoreFactory>,
    events: Arc<InMemoryEventCollector>,
    pool_id: PoolId,
    container: ContainerId,
}

fn class(s: &str) -> ObjectClass {
    s.parse().expect("valid object class")
}

fn ranks(n: u32) -> Vec<TargetId> {
    (0..n).map(TargetId::new).collect()
}

fn settings(fetch_timeout: Duration, teardown_timeout: Duration) -> PoolSettings {
    PoolSettings {
        rebuild: RebuildConfig {
            shard_fetch_timeout: fetch_timeout,
            cycle_interval: Duration::from_millis(10),
            ..RebuildConfig::default()
        },
        teardown_timeout,
    }
}

async fn pool_with(targets: u32, object_class: &str, policy: SelfHeal, settings: PoolSettings) -> Pool {
    let stores = Arc::new(InMemoryStoreFactory::new());
    let events = Arc::new(InMemoryEventCollector::new());
    let manager = PoolManager::new(stores.clone(), events.clone(), settings).unwrap();

    let pool_id = manager.create_pool(&ranks(targets)).await.unwrap();
    manager.set_policy(pool_id, policy).await.unwrap();
    let container = manager
        .create_container(pool_id, ContainerProps::for_class(class(object_class)))
        .await
        .unwrap();

    Pool {
        manager,
        stores,
        events,
        pool_id,
        container,
    }
}

async fn pool(targets: u32, object_class: &str, policy: SelfHeal) -> Pool {
    pool_with(
        targets,
        object_class,
        policy,
        settings(Duration::from_secs(2), Duration::from_secs(5)),
    )
    .await
}

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

impl Pool {
    fn shard_target(&self, object_id: ObjectId, index: usize) -> TargetId {
        self.manager.placement().layout(object_id).unwrap().targets[index]
    }

    fn corrupt(&self, object_id: ObjectId, index: usize) {
        let target = self.shard_target(object_id, index);
        let store = self.stores.store(target).unwrap();
        assert!(store.corrupt(&ShardKey::new(object_id, index)));
    }

    async fn rebuild_until_settled(&self) {
        for _ in 0..20 {
            let pending = self
                .manager
                .controller()
                .tasks_for_pool(self.pool_id)
                .iter()
                .any(|t| t.state == RebuildState::Reconstructing);
            if !pending {
                return;
            }
            self.manager.controller().run_cycle().await;
        }
    }
}

// =============================================================================
// Target failure
// =============================================================================

#[tokio::test]
async fn test_enabled_pool_rebuilds_lost_shard() {
    let p = pool(4, "EC_2P1", SelfHeal::Enabled).await;
    let data = "hello-world".repeat(1000).into_bytes();
    let object = p.manager.write_default(p.container, &data).await.unwrap();
    let failed = p.shard_target(object, 0);

    assert_eq!(p.manager.fail_target(p.pool_id, failed).await.unwrap(), 1);
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Reconstructing);

    p.rebuild_until_settled().await;
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Done);

    let layout = p.manager.placement().layout(object).unwrap();
    assert!(!layout.targets.contains(&failed));
    assert_eq!(p.manager.read(p.container, object).await.unwrap(), data);
    assert_eq!(p.manager.metrics().reads("ok"), 1);
    assert_eq!(p.manager.metrics().shards_reconstructed.get(), 1);
    assert_eq!(p.events.events_of_type("RebuildCompleted").len(), 1);
}

#[tokio::test]
async fn test_disabled_pool_serves_degraded_then_fails() {
    let p = pool(4, "EC_2P1", SelfHeal::Disabled).await;
    let data = payload(333, 2);
    let object = p.manager.write_default(p.container, &data).await.unwrap();

    p.manager
        .fail_target(p.pool_id, p.shard_target(object, 0))
        .await
        .unwrap();
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Suspended);
    assert_eq!(p.manager.read(p.container, object).await.unwrap(), data);
    assert_eq!(p.manager.metrics().reads("degraded"), 1);
    assert_eq!(p.events.events_of_type("DegradedRead").len(), 1);

    p.manager
        .fail_target(p.pool_id, p.shard_target(object, 1))
        .await
        .unwrap();
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Failed);
    assert_matches!(
        p.manager.read(p.container, object).await,
        Err(Error::InsufficientShards {
            available: 1,
            required: 2
        })
    );
    assert_eq!(p.manager.metrics().reads("failed"), 1);
}

#[tokio::test]
async fn test_redundancy_factor_above_parity_rejected() {
    let stores = Arc::new(InMemoryStoreFactory::new());
    let events = Arc::new(InMemoryEventCollector::new());
    let manager = PoolManager::new(stores, events, PoolSettings::default()).unwrap();
    let pool_id = manager.create_pool(&ranks(6)).await.unwrap();

    let props = ContainerProps {
        redundancy_factor: 2,
        object_class: Some(class("EC_2P1")),
    };
    assert_matches!(
        manager.create_container(pool_id, props).await,
        Err(Error::PolicyViolation(_))
    );
}

#[tokio::test]
async fn test_suspended_until_policy_enabled() {
    let p = pool(5, "EC_2P1", SelfHeal::Disabled).await;
    let objects: Vec<ObjectId> = {
        let mut ids = Vec::new();
        for seed in 0..6 {
            ids.push(p.manager.write_default(p.container, &payload(64, seed)).await.unwrap());
        }
        ids
    };

    p.manager.fail_target(p.pool_id, TargetId::new(2)).await.unwrap();
    let affected: Vec<ObjectId> = objects
        .iter()
        .copied()
        .filter(|o| p.manager.rebuild_status(*o) != RebuildState::Idle)
        .collect();

    for _ in 0..3 {
        assert_eq!(p.manager.controller().run_cycle().await, 0);
    }
    for object in &affected {
        assert_eq!(p.manager.rebuild_status(*object), RebuildState::Suspended);
    }

    p.manager.set_policy(p.pool_id, SelfHeal::Enabled).await.unwrap();
    for object in &affected {
        assert_eq!(p.manager.rebuild_status(*object), RebuildState::Reconstructing);
    }

    p.rebuild_until_settled().await;
    for (seed, object) in objects.iter().enumerate() {
        assert_eq!(
            p.manager.read(p.container, *object).await.unwrap(),
            payload(64, seed as u8)
        );
        if affected.contains(object) {
            assert_eq!(p.manager.rebuild_status(*object), RebuildState::Done);
        }
    }
}

#[tokio::test]
async fn test_added_target_becomes_rebuild_destination() {
    let p = pool(3, "EC_2P1", SelfHeal::Enabled).await;
    let object = p.manager.write_default(p.container, b"three wide").await.unwrap();

    p.manager
        .add_targets(p.pool_id, &[TargetId::new(3)])
        .await
        .unwrap();
    p.manager
        .fail_target(p.pool_id, TargetId::new(0))
        .await
        .unwrap();
    p.rebuild_until_settled().await;

    assert_eq!(p.manager.rebuild_status(object), RebuildState::Done);
    let layout = p.manager.placement().layout(object).unwrap();
    assert!(layout.targets.contains(&TargetId::new(3)));
    assert_eq!(p.manager.read(p.container, object).await.unwrap(), b"three wide");
}

#[tokio::test]
async fn test_no_spare_target_fails_rebuild_but_object_stays_readable() {
    let p = pool(3, "EC_2P1", SelfHeal::Enabled).await;
    let object = p.manager.write_default(p.container, b"nowhere to go").await.unwrap();

    p.manager
        .fail_target(p.pool_id, TargetId::new(1))
        .await
        .unwrap();
    p.rebuild_until_settled().await;

    let task = p.manager.controller().task(object).unwrap();
    assert_eq!(task.state, RebuildState::Failed);
    assert!(task.last_error.unwrap().contains("Insufficient targets"));
    assert_eq!(p.manager.read(p.container, object).await.unwrap(), b"nowhere to go");

    assert!(p.manager.controller().clear_task(object));
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Idle);
}

// =============================================================================
// Corruption and slow targets
// =============================================================================

#[tokio::test]
async fn test_corrupt_shard_detected_and_repaired() {
    let p = pool(4, "EC_2P1", SelfHeal::Enabled).await;
    let data = payload(4096, 3);
    let object = p.manager.write_default(p.container, &data).await.unwrap();
    let target = p.shard_target(object, 1);

    p.corrupt(object, 1);
    assert_eq!(p.manager.read(p.container, object).await.unwrap(), data);
    assert_eq!(p.manager.metrics().corrupt_shards.get(), 1);
    assert_eq!(p.events.events_of_type("CorruptShardDetected").len(), 1);
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Reconstructing);

    p.rebuild_until_settled().await;
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Done);
    assert_eq!(p.shard_target(object, 1), target);

    assert_eq!(p.manager.read(p.container, object).await.unwrap(), data);
    assert_eq!(p.manager.metrics().reads("ok"), 1);
}

#[tokio::test]
async fn test_too_many_corrupt_shards_is_an_error() {
    let p = pool(4, "EC_2P1", SelfHeal::Disabled).await;
    let object = p.manager.write_default(p.container, &payload(100, 4)).await.unwrap();

    p.corrupt(object, 0);
    p.corrupt(object, 2);
    assert_matches!(
        p.manager.read(p.container, object).await,
        Err(Error::CorruptShard { shard_index: 0, .. })
    );
    // Disabled pools record the damage without queueing repairs.
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Idle);
}

#[tokio::test]
async fn test_slow_target_read_falls_back_to_parity() {
    let p = pool_with(
        4,
        "EC_2P1",
        SelfHeal::Enabled,
        settings(Duration::from_millis(50), Duration::from_secs(5)),
    )
    .await;
    let data = payload(900, 5);
    let object = p.manager.write_default(p.container, &data).await.unwrap();
    let slow = p.shard_target(object, 0);
    p.stores
        .store(slow)
        .unwrap()
        .set_latency(Some(Duration::from_secs(2)));

    let started = Instant::now();
    assert_eq!(p.manager.read(p.container, object).await.unwrap(), data);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(p.manager.targets().is_live(slow));
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Idle);
    assert_eq!(p.manager.metrics().reads("degraded"), 1);
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test]
async fn test_teardown_wait_aborts_after_timeout() {
    let p = pool_with(
        4,
        "EC_2P1",
        SelfHeal::Disabled,
        settings(Duration::from_secs(2), Duration::from_millis(100)),
    )
    .await;
    let object = p.manager.write_default(p.container, b"stuck").await.unwrap();
    p.manager
        .fail_target(p.pool_id, p.shard_target(object, 2))
        .await
        .unwrap();
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Suspended);

    let started = Instant::now();
    p.manager
        .destroy_container(p.container, Teardown::Wait)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(p.manager.rebuild_status(object), RebuildState::Failed);
    assert!(p.manager.placement().layout(object).is_none());
    assert_matches!(
        p.events.events_of_type("ContainerDestroyed").as_slice(),
        [healpool::domain::DomainEvent::ContainerDestroyed { objects: 1, aborted_tasks: 1, .. }]
    );
    assert_matches!(
        p.manager.read(p.container, object).await,
        Err(Error::NotFound(_))
    );
}

#[tokio::test]
async fn test_teardown_force_is_immediate() {
    let p = pool_with(
        4,
        "EC_2P1",
        SelfHeal::Disabled,
        settings(Duration::from_secs(2), Duration::from_secs(30)),
    )
    .await;
    let object = p.manager.write_default(p.container, b"stuck").await.unwrap();
    p.manager
        .fail_target(p.pool_id, p.shard_target(object, 0))
        .await
        .unwrap();

    let started = Instant::now();
    p.manager
        .destroy_container(p.container, Teardown::Force)
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Failed);

    let space = p.manager.pool_space(p.pool_id).unwrap();
    assert_eq!(space.total_shards(), 0);
    assert_eq!(space.total_bytes(), 0);
}

#[tokio::test]
async fn test_teardown_wait_lets_background_rebuild_finish() {
    let p = pool(4, "EC_2P1", SelfHeal::Enabled).await;
    let object = p.manager.write_default(p.container, &payload(2048, 6)).await.unwrap();
    p.manager
        .fail_target(p.pool_id, p.shard_target(object, 1))
        .await
        .unwrap();

    let controller = p.manager.controller().clone();
    let handle = tokio::spawn(controller.clone().run());

    p.manager
        .destroy_container(p.container, Teardown::Wait)
        .await
        .unwrap();
    controller.shutdown();
    handle.await.unwrap();

    // The finished task went with the object.
    assert!(p.events.history(object).contains(&"RebuildCompleted"));
    assert_eq!(p.manager.rebuild_status(object), RebuildState::Idle);
    assert!(p.manager.controller().tasks().is_empty());
    assert_matches!(
        p.events.events_of_type("ContainerDestroyed").as_slice(),
        [healpool::domain::DomainEvent::ContainerDestroyed { aborted_tasks: 0, .. }]
    );
}

// =============================================================================
// Concurrency and durability
// =============================================================================

#[tokio::test]
async fn test_concurrent_writes_and_reads() {
    let p = pool(6, "EC_4P2", SelfHeal::Enabled).await;

    let writes = (0..16u8).map(|seed| {
        let manager = &p.manager;
        let container = p.container;
        async move {
            let data = payload(1000 + seed as usize, seed);
            let id = manager.write_default(container, &data).await.unwrap();
            (id, data)
        }
    });
    let written = join_all(writes).await;
    assert_eq!(p.manager.objects(p.container).unwrap().len(), 16);

    let reads = written
        .iter()
        .map(|(id, _)| p.manager.read(p.container, *id));
    for (result, (_, data)) in join_all(reads).await.into_iter().zip(&written) {
        assert_eq!(&result.unwrap(), data);
    }
}

#[tokio::test]
async fn test_file_stores_hold_shards_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(InMemoryEventCollector::new());
    let manager = PoolManager::new(
        Arc::new(FileStoreFactory::new(dir.path())),
        events,
        settings(Duration::from_secs(2), Duration::from_secs(5)),
    )
    .unwrap();

    let pool_id = manager.create_pool(&ranks(4)).await.unwrap();
    let container = manager
        .create_container(pool_id, ContainerProps::for_class(class("EC_2P1")))
        .await
        .unwrap();
    let data = payload(5000, 7);
    let object = manager.write_default(container, &data).await.unwrap();
    let layout = manager.placement().layout(object).unwrap();

    // A fresh factory over the same directory sees every shard intact.
    let reopened = FileStoreFactory::new(dir.path());
    for (index, target) in layout.targets.iter().enumerate() {
        let store = reopened.open(*target).unwrap();
        let record = store.get(&ShardKey::new(object, index)).await.unwrap();
        assert!(record.is_intact());
        assert_eq!(record.checksum, layout.checksums[index]);
    }

    manager.fail_target(pool_id, layout.targets[0]).await.unwrap();
    manager.controller().run_cycle().await;
    assert_eq!(manager.rebuild_status(object), RebuildState::Done);
    assert_eq!(manager.read(container, object).await.unwrap(), data);
}

#[tokio::test]
async fn test_destroy_removes_shards_left_on_failed_target() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PoolManager::new(
        Arc::new(FileStoreFactory::new(dir.path())),
        Arc::new(InMemoryEventCollector::new()),
        settings(Duration::from_secs(2), Duration::from_secs(5)),
    )
    .unwrap();

    let pool_id = manager.create_pool(&ranks(4)).await.unwrap();
    manager.set_policy(pool_id, SelfHeal::Disabled).await.unwrap();
    let container = manager
        .create_container(pool_id, ContainerProps::for_class(class("EC_2P1")))
        .await
        .unwrap();
    let object = manager
        .write_default(container, &payload(3000, 9))
        .await
        .unwrap();
    let failed = manager.placement().layout(object).unwrap().targets[0];
    manager.fail_target(pool_id, failed).await.unwrap();

    manager
        .destroy_container(container, Teardown::Force)
        .await
        .unwrap();

    let reopened = FileStoreFactory::new(dir.path());
    for target in ranks(4) {
        let keys = reopened.open(target).unwrap().keys().await.unwrap();
        assert!(keys.is_empty(), "{} still holds {:?}", target, keys);
    }
}
