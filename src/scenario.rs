//! Rebuild Scenario Runner
//!
//! Drives a pool end to end from a [`Config`]: write the configured datasets
//! with every applicable object class, fail the configured ranks, let the
//! rebuild controller heal what it may, then read everything back and check
//! it byte for byte.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::adapters::{FileStoreFactory, InMemoryStoreFactory};
use crate::config::{Config, DatasetSpec};
use crate::domain::ports::{
    ContainerId, EventPublisher, ObjectId, PoolId, SelfHeal, StoreFactory, TargetId,
};
use crate::ec::ObjectClass;
use crate::error::{Error, Result};
use crate::pool::{ContainerProps, PoolManager, PoolSettings, Teardown};
use crate::rebuild::{RebuildController, RebuildState};

/// Outcome for one object class.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassReport {
    pub class: String,
    pub redundancy_factor: usize,
    /// Set when the container could not be created
    pub rejected: Option<String>,
    pub written: usize,
    pub write_errors: Vec<String>,
    pub verified: usize,
    pub unreadable: usize,
    /// Reads that returned different bytes than were written
    pub mismatched: usize,
    /// Read failures of objects whose parity covers every failed rank
    pub unexpected_failures: Vec<String>,
}

impl ClassReport {
    fn is_success(&self) -> bool {
        self.mismatched == 0 && self.unexpected_failures.is_empty() && self.write_errors.is_empty()
    }
}

/// Outcome of a scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub pool_id: PoolId,
    pub self_heal: SelfHeal,
    pub failed_ranks: Vec<TargetId>,
    pub classes: Vec<ClassReport>,
    /// Final rebuild task states, by state name
    pub rebuilds: BTreeMap<String, usize>,
}

impl ScenarioReport {
    /// No wrong bytes, no unexpected read failure, no write error.
    pub fn is_success(&self) -> bool {
        self.classes.iter().all(ClassReport::is_success)
    }

    pub fn class(&self, class: ObjectClass) -> Option<&ClassReport> {
        let name = class.to_string();
        self.classes.iter().find(|c| c.class == name)
    }

    pub fn rebuilds_in(&self, state: RebuildState) -> usize {
        self.rebuilds.get(state.as_str()).copied().unwrap_or(0)
    }
}

impl std::fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "pool {} self_heal={} failed={:?}",
            self.pool_id,
            self.self_heal,
            self.failed_ranks.iter().map(|t| t.rank()).collect::<Vec<_>>()
        )?;
        for c in &self.classes {
            if let Some(reason) = &c.rejected {
                writeln!(f, "  {:<8} rejected: {}", c.class, reason)?;
                continue;
            }
            writeln!(
                f,
                "  {:<8} rf={} written={} verified={} unreadable={} mismatched={} unexpected={}",
                c.class,
                c.redundancy_factor,
                c.written,
                c.verified,
                c.unreadable,
                c.mismatched,
                c.unexpected_failures.len()
            )?;
        }
        write!(f, "  rebuilds {:?}", self.rebuilds)?;
        if self.is_success() {
            write!(f, "\nPASS")
        } else {
            write!(f, "\nFAIL")
        }
    }
}

struct Written {
    object_id: ObjectId,
    data: Vec<u8>,
}

struct ClassRun {
    class: ObjectClass,
    container: Option<ContainerId>,
    objects: Vec<Written>,
    report: ClassReport,
}

/// Runs the configured scenario against a fresh pool.
pub struct ScenarioRunner {
    config: Config,
    manager: PoolManager,
}

impl ScenarioRunner {
    /// Build a runner over file stores under `data_dir`, or in-memory stores
    /// when none is configured.
    pub fn new(config: Config, publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let factory: Arc<dyn StoreFactory> = match &config.data_dir {
            Some(dir) => Arc::new(FileStoreFactory::new(dir)),
            None => Arc::new(InMemoryStoreFactory::new()),
        };
        Self::with_factory(config, factory, publisher)
    }

    pub fn with_factory(
        config: Config,
        factory: Arc<dyn StoreFactory>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = PoolManager::new(factory, publisher, PoolSettings::from_config(&config)?)?;
        Ok(Self { config, manager })
    }

    pub fn manager(&self) -> &PoolManager {
        &self.manager
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[instrument(skip(self), fields(targets = self.config.targets, self_heal = %self.config.self_heal))]
    pub async fn run(&self) -> Result<ScenarioReport> {
        let ranks: Vec<TargetId> = (0..self.config.targets).map(TargetId::new).collect();
        let pool_id = self.manager.create_pool(&ranks).await?;
        if !self.config.self_heal.is_enabled() {
            self.manager.set_policy(pool_id, self.config.self_heal).await?;
        }

        let mut runs = Vec::new();
        for class in self.config.applicable_classes() {
            runs.push(self.write_class(pool_id, class).await?);
        }
        self.log_space(pool_id, "after write")?;

        let mut failed = Vec::new();
        for rank in &self.config.fail_ranks {
            let target = TargetId::new(*rank);
            let affected = self.manager.fail_target(pool_id, target).await?;
            failed.push(target);
            info!(%target, affected, "Rank excluded");
            if self.config.self_heal.is_enabled() {
                self.drive_rebuild(pool_id).await;
            }
        }

        for run in &mut runs {
            self.verify_class(run, failed.len()).await;
        }
        self.log_space(pool_id, "after read")?;

        let mut rebuilds = BTreeMap::new();
        for task in self.manager.controller().tasks_for_pool(pool_id) {
            *rebuilds.entry(task.state.as_str().to_string()).or_insert(0) += 1;
        }

        // Suspended tasks never finish on their own.
        let teardown = if self.config.self_heal.is_enabled() {
            Teardown::Wait
        } else {
            Teardown::Force
        };
        self.manager.destroy_pool(pool_id, teardown).await?;

        let report = ScenarioReport {
            pool_id,
            self_heal: self.config.self_heal,
            failed_ranks: failed,
            classes: runs.into_iter().map(|r| r.report).collect(),
            rebuilds,
        };
        if report.is_success() {
            info!(%pool_id, "Scenario passed");
        } else {
            error!(%pool_id, "Scenario failed");
        }
        Ok(report)
    }

    async fn write_class(&self, pool_id: PoolId, class: ObjectClass) -> Result<ClassRun> {
        let redundancy_factor = self
            .config
            .redundancy_factor
            .unwrap_or_else(|| class.parity_shards());
        let mut run = ClassRun {
            class,
            container: None,
            objects: Vec::new(),
            report: ClassReport {
                class: class.to_string(),
                redundancy_factor,
                ..ClassReport::default()
            },
        };

        let props = ContainerProps {
            redundancy_factor,
            object_class: Some(class),
        };
        let container = match self.manager.create_container(pool_id, props).await {
            Ok(container) => container,
            Err(e @ Error::PolicyViolation(_)) => {
                warn!(%class, redundancy_factor, error = %e, "Container rejected");
                run.report.rejected = Some(e.to_string());
                return Ok(run);
            }
            Err(e) => return Err(e),
        };
        run.container = Some(container);

        for (d, dataset) in self.config.datasets.iter().enumerate() {
            for o in 0..dataset.object_qty {
                let seed = xxh3_64(format!("{}/{}/{}", class, d, o).as_bytes());
                let data = dataset_payload(dataset, seed)?;
                self.write_one(&mut run, container, data).await;
            }
        }

        for [chunk, block, transfer] in self.config.transfer_matrix()? {
            let count = (block / transfer).max(1);
            info!(%class, chunk, block, transfer, count, "Writing transfer set");
            for i in 0..count {
                let seed = xxh3_64(format!("{}/{}/{}/{}", class, block, transfer, i).as_bytes());
                let mut data = Vec::new();
                fill(&mut data, transfer as usize, seed);
                self.write_one(&mut run, container, data).await;
            }
        }

        info!(%class, written = run.report.written, "Class written");
        Ok(run)
    }

    async fn write_one(&self, run: &mut ClassRun, container: ContainerId, data: Vec<u8>) {
        match self.manager.write(container, &data, run.class).await {
            Ok(object_id) => {
                run.report.written += 1;
                run.objects.push(Written { object_id, data });
            }
            Err(e) => {
                warn!(class = %run.class, error = %e, "Write failed");
                run.report.write_errors.push(e.to_string());
            }
        }
    }

    /// Run rebuild cycles until no task is left to execute.
    async fn drive_rebuild(&self, pool_id: PoolId) {
        let controller: &RebuildController = self.manager.controller();
        let pending = |c: &RebuildController| {
            c.tasks_for_pool(pool_id)
                .iter()
                .filter(|t| t.state == RebuildState::Reconstructing)
                .count()
        };

        let mut budget = pending(controller) * (controller.config().max_retries as usize + 1) + 1;
        while pending(controller) > 0 && budget > 0 {
            if controller.run_cycle().await == 0 {
                tokio::time::sleep(controller.config().cycle_interval).await;
            }
            budget -= 1;
        }
        let left = pending(controller);
        if left > 0 {
            warn!(%pool_id, left, "Rebuild did not settle");
        }
    }

    async fn verify_class(&self, run: &mut ClassRun, failures: usize) {
        let Some(container) = run.container else {
            return;
        };
        let must_read = run.class.parity_shards() >= failures;

        for written in &run.objects {
            match self.manager.read(container, written.object_id).await {
                Ok(data) if data == written.data => run.report.verified += 1,
                Ok(_) => {
                    error!(object_id = %written.object_id, class = %run.class, "Read returned wrong bytes");
                    run.report.mismatched += 1;
                }
                Err(e) => {
                    run.report.unreadable += 1;
                    if must_read {
                        error!(object_id = %written.object_id, class = %run.class, error = %e, "Object unreadable");
                        run.report
                            .unexpected_failures
                            .push(format!("{}: {}", written.object_id, e));
                    }
                }
            }
        }
    }

    fn log_space(&self, pool_id: PoolId, phase: &str) -> Result<()> {
        let space = self.manager.pool_space(pool_id)?;
        info!(phase, shards = space.total_shards(), bytes = space.total_bytes(), "Pool space\n{}", space);
        Ok(())
    }
}

/// `record_qty` records of dkey, akey and value bytes.
fn dataset_payload(dataset: &DatasetSpec, seed: u64) -> Result<Vec<u8>> {
    let data_size = dataset.data_size.bytes()? as usize;
    let record_len = dataset.dkey_size + dataset.akey_size + data_size;
    let mut out = Vec::with_capacity(record_len * dataset.record_qty);
    for r in 0..dataset.record_qty as u64 {
        fill(&mut out, record_len, seed ^ r.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    }
    Ok(out)
}

/// Append `len` pseudo-random bytes derived from `seed`.
fn fill(out: &mut Vec<u8>, len: usize, seed: u64) {
    // splitmix64 step so neighbouring seeds start far apart
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    let mut state = (z ^ (z >> 31)) | 1;
    out.extend((0..len).map(|_| {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        (state >> 24) as u8
    }));
}
