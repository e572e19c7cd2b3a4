//! Rebuild Controller
//!
//! Owns the per-object rebuild tasks and drives them through their state
//! machine. Target failures, corruption reports and policy changes open,
//! merge, suspend or resume tasks; each scheduling cycle executes the ready
//! ones: fetch survivors, reconstruct, write to replacement targets, verify,
//! relocate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::events::DomainEvent;
use crate::domain::ports::{EventPublisher, ObjectId, PoolId, SelfHeal, ShardKey, ShardRecord, TargetId};
use crate::ec::{EcDecoder, ShardPayload};
use crate::error::{Error, Result};
use crate::metrics::StoreMetrics;
use crate::object_lock::ObjectLocks;
use crate::placement::{ObjectLayout, PlacementMap};
use crate::rebuild::task::{RebuildConfig, RebuildEvent, RebuildState, RebuildTask};
use crate::targets::{ShardFetch, TargetRegistry};

#[derive(Debug, Default)]
struct TaskTable {
    tasks: HashMap<ObjectId, RebuildTask>,
    next_seq: u64,
}

impl TaskTable {
    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[derive(Debug)]
enum Outcome {
    /// Shards written, verified and relocated
    Rebuilt(Vec<(usize, TargetId)>),
    /// Worth another attempt
    Retry(String),
    /// Never going to succeed
    Fatal(String),
}

/// Drives rebuild tasks for every pool.
pub struct RebuildController {
    config: RebuildConfig,
    placement: Arc<PlacementMap>,
    targets: Arc<TargetRegistry>,
    locks: Arc<ObjectLocks>,
    publisher: Arc<dyn EventPublisher>,
    metrics: StoreMetrics,
    policies: DashMap<PoolId, SelfHeal>,
    tasks: Mutex<TaskTable>,
    event_tx: mpsc::Sender<RebuildEvent>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<RebuildEvent>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
}

impl std::fmt::Debug for RebuildController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildController")
            .field("config", &self.config)
            .field("tasks", &self.tasks.lock().tasks.len())
            .finish()
    }
}

impl RebuildController {
    pub fn new(
        config: RebuildConfig,
        placement: Arc<PlacementMap>,
        targets: Arc<TargetRegistry>,
        locks: Arc<ObjectLocks>,
        publisher: Arc<dyn EventPublisher>,
        metrics: StoreMetrics,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1000);

        Arc::new(Self {
            config,
            placement,
            targets,
            locks,
            publisher,
            metrics,
            policies: DashMap::new(),
            tasks: Mutex::new(TaskTable::default()),
            event_tx: tx,
            event_rx: tokio::sync::Mutex::new(rx),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    /// Start tracking a pool's self-heal policy.
    pub fn register_pool(&self, pool_id: PoolId, self_heal: SelfHeal) {
        self.policies.insert(pool_id, self_heal);
    }

    pub fn unregister_pool(&self, pool_id: PoolId) {
        self.policies.remove(&pool_id);
    }

    /// Current policy of a pool. Unknown pools heal.
    pub fn policy(&self, pool_id: PoolId) -> SelfHeal {
        self.policies
            .get(&pool_id)
            .map(|p| *p)
            .unwrap_or_default()
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Queue an event for the background loop.
    pub async fn submit(&self, event: RebuildEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|e| Error::Internal(format!("Failed to queue rebuild event: {}", e)))
    }

    /// Apply an event to the task table immediately.
    #[instrument(skip(self))]
    pub async fn handle_event(&self, event: RebuildEvent) -> Result<()> {
        let events = match event {
            RebuildEvent::TargetFailed { pool_id, target } => self.on_target_failed(pool_id, target),
            RebuildEvent::PolicyChanged { pool_id, self_heal } => {
                self.on_policy_changed(pool_id, self_heal)
            }
            RebuildEvent::CorruptShard {
                pool_id,
                object_id,
                shard_index,
            } => self.on_corrupt_shard(pool_id, object_id, shard_index)?,
        };

        self.publish(events).await;
        Ok(())
    }

    fn on_target_failed(&self, pool_id: PoolId, target: TargetId) -> Vec<DomainEvent> {
        let policy = self.policy(pool_id);
        let mut events = Vec::new();
        let mut table = self.tasks.lock();

        for (object_id, _) in self.placement.objects_on_target(target) {
            let Some(layout) = self.placement.layout(object_id) else {
                continue;
            };
            if layout.pool_id != pool_id {
                continue;
            }

            // Everything on a dead target counts, including losses from
            // earlier failures that were never rebuilt.
            let lost: Vec<usize> = layout
                .targets
                .iter()
                .enumerate()
                .filter(|(_, t)| !self.targets.is_live(**t))
                .map(|(i, _)| i)
                .collect();
            self.merge_loss(&mut table, &layout, lost, Some(target), policy, &mut events);
        }

        events
    }

    fn on_corrupt_shard(
        &self,
        pool_id: PoolId,
        object_id: ObjectId,
        shard_index: usize,
    ) -> Result<Vec<DomainEvent>> {
        let layout = self
            .placement
            .layout(object_id)
            .filter(|l| l.pool_id == pool_id)
            .ok_or_else(|| Error::not_found("object", object_id))?;
        if shard_index >= layout.targets.len() {
            return Err(Error::Internal(format!(
                "shard index {} out of range for object {}",
                shard_index, object_id
            )));
        }

        let policy = self.policy(pool_id);
        let mut events = Vec::new();
        let mut table = self.tasks.lock();
        self.merge_loss(&mut table, &layout, vec![shard_index], None, policy, &mut events);
        Ok(events)
    }

    /// Open a task for `lost` shards, or fold them into the existing one.
    fn merge_loss(
        &self,
        table: &mut TaskTable,
        layout: &ObjectLayout,
        lost: Vec<usize>,
        failed_target: Option<TargetId>,
        policy: SelfHeal,
        events: &mut Vec<DomainEvent>,
    ) {
        let seq = table.next_seq();
        let task = table.tasks.entry(layout.object_id).or_insert_with(|| {
            self.metrics.record_transition(RebuildState::Detecting.as_str());
            RebuildTask::new(layout.pool_id, layout.object_id, layout.class, seq)
        });
        if task.state == RebuildState::Done {
            task.reopen(seq);
            self.metrics.record_transition(RebuildState::Detecting.as_str());
        }

        task.missing.extend(lost);
        if let Some(target) = failed_target {
            task.failed_targets.insert(target);
        }
        task.updated_at = Utc::now();

        match task.state {
            RebuildState::Failed => {}
            _ if !task.recoverable() => {
                let reason = loss_reason(task);
                error!(object_id = %task.object_id, %reason, "Object is unrecoverable");
                task.last_error = Some(reason.clone());
                self.set_state(task, RebuildState::Failed);
                events.push(DomainEvent::rebuild_failed(task.object_id, reason));
            }
            RebuildState::Detecting => {
                let next = if policy.is_enabled() {
                    RebuildState::Reconstructing
                } else {
                    RebuildState::Suspended
                };
                self.set_state(task, next);
                events.push(state_event(task));
            }
            // Active tasks keep their state; the executor picks up the
            // merged shards when it finishes.
            _ => {
                debug!(object_id = %task.object_id, missing = ?task.missing, state = %task.state, "Merged loss into active task");
            }
        }
    }

    fn on_policy_changed(&self, pool_id: PoolId, self_heal: SelfHeal) -> Vec<DomainEvent> {
        self.policies.insert(pool_id, self_heal);
        info!(%pool_id, %self_heal, "Self-heal policy changed");

        let mut events = Vec::new();
        let mut table = self.tasks.lock();
        let mut affected: Vec<&mut RebuildTask> = table
            .tasks
            .values_mut()
            .filter(|t| t.pool_id == pool_id)
            .filter(|t| match self_heal {
                SelfHeal::Enabled => t.state == RebuildState::Suspended,
                SelfHeal::Disabled => t.state == RebuildState::Reconstructing && !t.in_flight,
            })
            .collect();
        affected.sort_by_key(|t| t.failure_seq);

        let next = match self_heal {
            SelfHeal::Enabled => RebuildState::Reconstructing,
            SelfHeal::Disabled => RebuildState::Suspended,
        };
        for task in affected {
            self.set_state(task, next);
            events.push(state_event(task));
        }

        events
    }

    fn set_state(&self, task: &mut RebuildTask, state: RebuildState) {
        if task.state == state {
            return;
        }
        debug!(object_id = %task.object_id, from = %task.state, to = %state, "Rebuild transition");
        task.transition(state);
        self.metrics.record_transition(state.as_str());
    }

    async fn publish(&self, events: Vec<DomainEvent>) {
        if events.is_empty() {
            return;
        }
        if let Err(e) = self.publisher.publish_all(events).await {
            warn!(error = %e, "Failed to publish rebuild events");
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute up to `max_concurrent` ready tasks, oldest failure first.
    ///
    /// Returns how many tasks were executed.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> usize {
        let batch: Vec<RebuildTask> = {
            let mut table = self.tasks.lock();
            let mut ready: Vec<&mut RebuildTask> = table
                .tasks
                .values_mut()
                .filter(|t| t.state == RebuildState::Reconstructing && !t.in_flight)
                .collect();
            ready.sort_by_key(|t| t.failure_seq);

            ready
                .into_iter()
                .take(self.config.max_concurrent.max(1))
                .map(|t| {
                    t.in_flight = true;
                    t.attempts += 1;
                    t.updated_at = Utc::now();
                    t.clone()
                })
                .collect()
        };

        if batch.is_empty() {
            return 0;
        }

        let executed = batch.len();
        self.metrics.rebuilds_in_flight.add(executed as i64);
        debug!(tasks = executed, "Running rebuild cycle");

        let results = join_all(batch.into_iter().map(|task| async move {
            let outcome = self.execute(&task).await;
            (task, outcome)
        }))
        .await;

        let mut events = Vec::new();
        for (task, outcome) in results {
            events.extend(self.complete(&task, outcome));
        }
        self.metrics.rebuilds_in_flight.sub(executed as i64);
        self.locks.prune_idle();
        self.publish(events).await;

        executed
    }

    #[instrument(skip(self, task), fields(object_id = %task.object_id, attempt = task.attempts))]
    async fn execute(&self, task: &RebuildTask) -> Outcome {
        let _token = self.locks.lock(task.object_id).await;

        let Some(layout) = self.placement.layout(task.object_id) else {
            return Outcome::Fatal("object no longer exists".to_string());
        };

        match self.rebuild_object(task, &layout).await {
            Ok(rebuilt) => Outcome::Rebuilt(rebuilt),
            Err(e @ Error::InsufficientTargets { .. }) => Outcome::Fatal(e.to_string()),
            Err(e) => {
                warn!(error = %e, "Rebuild attempt failed");
                Outcome::Retry(e.to_string())
            }
        }
    }

    async fn rebuild_object(
        &self,
        task: &RebuildTask,
        layout: &ObjectLayout,
    ) -> Result<Vec<(usize, TargetId)>> {
        let object_id = layout.object_id;
        let decoder = EcDecoder::new(layout.class)?;

        let mut slots: Vec<Option<ShardPayload>> = Vec::with_capacity(layout.targets.len());
        for index in 0..layout.targets.len() {
            let shard = if task.missing.contains(&index) {
                None
            } else {
                self.fetch_intact(layout, index).await
            };
            slots.push(shard);
        }

        let lost: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect();
        if lost.is_empty() {
            return Ok(Vec::new());
        }

        let full = decoder.reconstruct(&slots)?;
        let live = self.targets.live_targets(layout.pool_id);
        let mut occupied = layout.targets.clone();
        let mut written = Vec::with_capacity(lost.len());

        for &index in &lost {
            let rebuilt = &full[index];
            let expected = layout.checksums[index];
            if rebuilt.checksum != expected {
                return Err(Error::EcReconstructionFailed {
                    object_id: object_id.to_string(),
                    reason: format!(
                        "rebuilt shard {} has checksum {:#010x}, recorded {:#010x}",
                        index, rebuilt.checksum, expected
                    ),
                });
            }

            let current = occupied[index];
            let target = if self.targets.is_live(current) {
                current
            } else {
                let others: Vec<TargetId> = occupied
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != index)
                    .map(|(_, t)| *t)
                    .collect();
                self.placement
                    .pick_replacement(object_id, index, &live, &others)?
            };
            occupied[index] = target;

            let record = ShardRecord {
                object_id,
                shard_index: index,
                kind: rebuilt.kind,
                checksum: rebuilt.checksum,
                payload: rebuilt.data.clone(),
            };
            self.targets.store(target)?.put(&record).await?;
            debug!(%object_id, shard_index = index, %target, "Wrote rebuilt shard");
            written.push((index, target));
        }

        self.enter_verifying(task);

        for &(index, target) in &written {
            let key = ShardKey::new(object_id, index);
            let expected = layout.checksums[index];
            match self
                .targets
                .fetch(target, key, self.config.shard_fetch_timeout)
                .await
            {
                ShardFetch::Found(record) if record.is_intact() && record.checksum == expected => {}
                ShardFetch::Found(record) => {
                    return Err(Error::CorruptShard {
                        shard_index: index,
                        expected,
                        actual: record.actual_checksum(),
                    });
                }
                ShardFetch::Unavailable | ShardFetch::TimedOut => {
                    return Err(Error::Internal(format!(
                        "rebuilt shard {} could not be read back from {}",
                        index, target
                    )));
                }
            }
        }

        for &(index, target) in &written {
            self.placement.relocate(object_id, index, target)?;
        }

        Ok(written)
    }

    /// Fetch a shard, dropping it if it is unavailable, slow or corrupt.
    async fn fetch_intact(&self, layout: &ObjectLayout, index: usize) -> Option<ShardPayload> {
        let target = layout.targets[index];
        let key = ShardKey::new(layout.object_id, index);

        match self
            .targets
            .fetch(target, key, self.config.shard_fetch_timeout)
            .await
        {
            ShardFetch::Found(record)
                if record.is_intact() && record.checksum == layout.checksums[index] =>
            {
                Some(ShardPayload {
                    index,
                    kind: record.kind,
                    data: record.payload,
                    checksum: record.checksum,
                })
            }
            ShardFetch::Found(_) => {
                warn!(object_id = %layout.object_id, shard_index = index, %target, "Skipping corrupt survivor");
                self.metrics.corrupt_shards.inc();
                None
            }
            ShardFetch::Unavailable | ShardFetch::TimedOut => None,
        }
    }

    fn enter_verifying(&self, task: &RebuildTask) {
        let mut table = self.tasks.lock();
        if let Some(current) = table.tasks.get_mut(&task.object_id) {
            if current.task_id == task.task_id && current.state == RebuildState::Reconstructing {
                self.set_state(current, RebuildState::Verifying);
            }
        }
    }

    fn complete(&self, task: &RebuildTask, outcome: Outcome) -> Vec<DomainEvent> {
        let mut events = Vec::new();
        let policy = self.policy(task.pool_id);
        let mut table = self.tasks.lock();

        let Some(current) = table.tasks.get_mut(&task.object_id) else {
            return events;
        };
        if current.task_id != task.task_id {
            return events;
        }
        current.in_flight = false;

        // Aborted, or merged past parity, while executing.
        if current.state == RebuildState::Failed {
            return events;
        }

        let retry_state = if policy.is_enabled() {
            RebuildState::Reconstructing
        } else {
            RebuildState::Suspended
        };

        match outcome {
            Outcome::Rebuilt(written) => {
                for &(index, target) in &written {
                    current.missing.remove(&index);
                    self.metrics.shards_reconstructed.inc();
                    events.push(DomainEvent::ShardReconstructed {
                        object_id: current.object_id,
                        shard_index: index,
                        target,
                        timestamp: Utc::now(),
                    });
                }
                for index in &task.missing {
                    current.missing.remove(index);
                }

                // A replacement may have failed after it was written.
                if let Some(layout) = self.placement.layout(current.object_id) {
                    let stranded = layout
                        .targets
                        .iter()
                        .enumerate()
                        .filter(|(_, t)| !self.targets.is_live(**t))
                        .map(|(i, _)| i);
                    current.missing.extend(stranded);
                }

                if !current.recoverable() {
                    let reason = loss_reason(current);
                    error!(object_id = %current.object_id, %reason, "Object is unrecoverable");
                    current.last_error = Some(reason.clone());
                    self.set_state(current, RebuildState::Failed);
                    events.push(DomainEvent::rebuild_failed(current.object_id, reason));
                } else if current.missing.is_empty() {
                    current.last_error = None;
                    self.set_state(current, RebuildState::Done);
                    info!(
                        object_id = %current.object_id,
                        shards = written.len(),
                        attempts = current.attempts,
                        "Rebuild completed"
                    );
                    events.push(DomainEvent::RebuildCompleted {
                        object_id: current.object_id,
                        shards_rebuilt: written.len(),
                        attempts: current.attempts,
                        timestamp: Utc::now(),
                    });
                } else {
                    self.set_state(current, retry_state);
                }
            }
            Outcome::Retry(reason) => {
                current.last_error = Some(reason.clone());
                if current.attempts >= self.config.max_retries {
                    error!(object_id = %current.object_id, attempts = current.attempts, %reason, "Rebuild out of retries");
                    self.set_state(current, RebuildState::Failed);
                    events.push(DomainEvent::rebuild_failed(current.object_id, reason));
                } else {
                    self.set_state(current, retry_state);
                }
            }
            Outcome::Fatal(reason) => {
                error!(object_id = %current.object_id, %reason, "Rebuild failed");
                current.last_error = Some(reason.clone());
                self.set_state(current, RebuildState::Failed);
                events.push(DomainEvent::rebuild_failed(current.object_id, reason));
            }
        }

        events
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// State of an object's rebuild, `Idle` if none was ever needed.
    pub fn status(&self, object_id: ObjectId) -> RebuildState {
        self.tasks
            .lock()
            .tasks
            .get(&object_id)
            .map(|t| t.state)
            .unwrap_or(RebuildState::Idle)
    }

    pub fn task(&self, object_id: ObjectId) -> Option<RebuildTask> {
        self.tasks.lock().tasks.get(&object_id).cloned()
    }

    /// Every task, oldest failure first.
    pub fn tasks(&self) -> Vec<RebuildTask> {
        self.select(|_| true)
    }

    pub fn tasks_for_pool(&self, pool_id: PoolId) -> Vec<RebuildTask> {
        self.select(|t| t.pool_id == pool_id)
    }

    pub fn failed_tasks(&self) -> Vec<RebuildTask> {
        self.select(|t| t.state == RebuildState::Failed)
    }

    fn select(&self, keep: impl Fn(&RebuildTask) -> bool) -> Vec<RebuildTask> {
        let mut tasks: Vec<RebuildTask> = self
            .tasks
            .lock()
            .tasks
            .values()
            .filter(|t| keep(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.failure_seq);
        tasks
    }

    /// Drop a finished task. Active tasks are kept; returns whether one
    /// was removed.
    pub fn clear_task(&self, object_id: ObjectId) -> bool {
        let mut table = self.tasks.lock();
        match table.tasks.get(&object_id) {
            Some(t) if t.state.is_terminal() && !t.in_flight => {
                table.tasks.remove(&object_id);
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Drop the `Done` tasks of deleted objects. `Failed` tasks stay until
    /// cleared. Returns how many were dropped.
    pub fn forget_done(&self, objects: &[ObjectId]) -> usize {
        let mut table = self.tasks.lock();
        let before = table.tasks.len();
        for id in objects {
            if table
                .tasks
                .get(id)
                .is_some_and(|t| t.state == RebuildState::Done && !t.in_flight)
            {
                table.tasks.remove(id);
            }
        }
        before - table.tasks.len()
    }

    /// Wait until every task of `objects` is `Done` or `Failed`.
    ///
    /// Returns false if `timeout` elapsed first.
    pub async fn wait_terminal(&self, objects: &[ObjectId], timeout: Duration) -> bool {
        let settled = || {
            let table = self.tasks.lock();
            objects.iter().all(|id| {
                table
                    .tasks
                    .get(id)
                    .map(|t| t.state.is_terminal() && !t.in_flight)
                    .unwrap_or(true)
            })
        };

        tokio::time::timeout(timeout, async {
            while !settled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Record every unfinished task of `objects` as `Failed`.
    ///
    /// Returns how many tasks were aborted.
    #[instrument(skip(self, objects), fields(objects = objects.len()))]
    pub async fn abort(&self, objects: &[ObjectId], reason: &str) -> usize {
        let mut events = Vec::new();
        {
            let mut table = self.tasks.lock();
            for id in objects {
                if let Some(task) = table.tasks.get_mut(id) {
                    if task.state.is_terminal() {
                        continue;
                    }
                    warn!(object_id = %id, state = %task.state, %reason, "Aborting rebuild");
                    task.last_error = Some(reason.to_string());
                    self.set_state(task, RebuildState::Failed);
                    events.push(DomainEvent::rebuild_failed(*id, reason));
                }
            }
        }

        let aborted = events.len();
        self.publish(events).await;
        aborted
    }

    // =========================================================================
    // Background loop
    // =========================================================================

    /// Run scheduling cycles and handle submitted events until shut down.
    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        info!("Starting rebuild controller with {:?}", self.config);

        let mut tick = interval(self.config.cycle_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rx = self.event_rx.lock().await;

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            tokio::select! {
                _ = self.shutdown_notify.notified() => break,

                _ = tick.tick() => {
                    self.run_cycle().await;
                }

                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_event(event).await {
                            error!("Error handling rebuild event: {}", e);
                        }
                    }
                    None => break,
                },
            }
        }

        info!("Rebuild controller shutting down");
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();
    }
}

fn loss_reason(task: &RebuildTask) -> String {
    format!(
        "{} shards lost, {} tolerates {}",
        task.missing.len(),
        task.class,
        task.class.parity_shards()
    )
}

fn state_event(task: &RebuildTask) -> DomainEvent {
    let missing_shards = task.missing_shards();
    let timestamp = Utc::now();
    match task.state {
        RebuildState::Suspended => DomainEvent::RebuildSuspended {
            object_id: task.object_id,
            missing_shards,
            timestamp,
        },
        _ => DomainEvent::RebuildStarted {
            object_id: task.object_id,
            missing_shards,
            timestamp,
        },
    }
}
