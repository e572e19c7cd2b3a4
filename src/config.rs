//! Configuration
//!
//! YAML configuration for a pool run: target count, self-heal policy, store
//! location, rebuild tuning, the object classes and datasets to exercise and
//! the ranks to fail.
//!
//! ```yaml
//! targets: 6
//! self_heal: exclude
//! object_classes:
//!   - class: OC_EC_2P1G1
//!     min_targets: 3
//!   - class: OC_EC_4P2G1
//!     min_targets: 6
//! datasets:
//!   - { object_qty: 20, record_qty: 1, akey_size: 5, dkey_size: 5, data_size: 4KiB }
//! fail_ranks: [5]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::ports::SelfHeal;
use crate::ec::ObjectClass;
use crate::error::{Error, Result};
use crate::rebuild::RebuildConfig;

/// A byte size written either as a plain number or with a unit suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Size {
    Bytes(u64),
    Text(String),
}

impl Size {
    pub fn bytes(&self) -> Result<u64> {
        match self {
            Size::Bytes(n) => Ok(*n),
            Size::Text(s) => parse_size(s),
        }
    }
}

impl From<u64> for Size {
    fn from(n: u64) -> Self {
        Size::Bytes(n)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Number of targets (server ranks) in the pool
    pub targets: u32,

    /// Pool self-heal policy
    #[serde(default)]
    pub self_heal: SelfHeal,

    /// Root of the file-backed stores; in-memory stores when absent
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Container redundancy factor; each class' parity when absent
    #[serde(default)]
    pub redundancy_factor: Option<usize>,

    #[serde(default)]
    pub store: StoreSettings,

    #[serde(default)]
    pub rebuild: RebuildSettings,

    #[serde(default = "default_object_classes")]
    pub object_classes: Vec<ClassEntry>,

    /// `[chunk, block, transfer]` size triples; each block is written as
    /// `block / transfer` objects of `transfer` bytes
    #[serde(default)]
    pub transfer_sizes: Vec<[Size; 3]>,

    /// Single-value datasets
    #[serde(default)]
    pub datasets: Vec<DatasetSpec>,

    /// Ranks failed in order after the dataset is written
    #[serde(default)]
    pub fail_ranks: Vec<u32>,
}

/// Shard store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    /// Upper bound on fetching a single shard (e.g. "500ms", "5s")
    #[serde(default = "default_fetch_timeout")]
    pub shard_fetch_timeout: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            shard_fetch_timeout: default_fetch_timeout(),
        }
    }
}

/// Rebuild controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RebuildSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_cycle_interval")]
    pub cycle_interval: String,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Upper bound on waiting for rebuilds during teardown
    #[serde(default = "default_teardown_timeout")]
    pub teardown_timeout: String,
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            cycle_interval: default_cycle_interval(),
            max_concurrent: default_max_concurrent(),
            teardown_timeout: default_teardown_timeout(),
        }
    }
}

/// An object class and the number of targets it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassEntry {
    pub class: ObjectClass,
    /// Defaults to the class' total shard count
    #[serde(default)]
    pub min_targets: Option<u32>,
}

impl ClassEntry {
    pub fn min_targets(&self) -> u32 {
        self.min_targets
            .unwrap_or(self.class.total_shards() as u32)
    }
}

/// Shape of a single-value dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSpec {
    pub object_qty: usize,
    pub record_qty: usize,
    pub akey_size: usize,
    pub dkey_size: usize,
    pub data_size: Size,
}

fn default_fetch_timeout() -> String {
    "5s".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_cycle_interval() -> String {
    "500ms".to_string()
}

fn default_max_concurrent() -> usize {
    4
}

fn default_teardown_timeout() -> String {
    "30s".to_string()
}

fn default_object_classes() -> Vec<ClassEntry> {
    ["EC_2P1", "EC_4P2"]
        .iter()
        .filter_map(|s| s.parse::<ObjectClass>().ok())
        .map(|class| ClassEntry {
            class,
            min_targets: None,
        })
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: 6,
            self_heal: SelfHeal::default(),
            data_dir: None,
            redundancy_factor: None,
            store: StoreSettings::default(),
            rebuild: RebuildSettings::default(),
            object_classes: default_object_classes(),
            transfer_sizes: Vec::new(),
            datasets: vec![DatasetSpec {
                object_qty: 8,
                record_qty: 2,
                akey_size: 5,
                dkey_size: 5,
                data_size: Size::Bytes(4096),
            }],
            fail_ranks: Vec::new(),
        }
    }
}

impl Config {
    /// Load and validate a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.targets == 0 {
            return Err(Error::Config("targets must be at least 1".to_string()));
        }

        let fetch = self.shard_fetch_timeout()?;
        if fetch.is_zero() {
            return Err(Error::Config("shard_fetch_timeout must be positive".to_string()));
        }
        let rebuild = self.rebuild_config()?;
        if rebuild.max_retries == 0 {
            return Err(Error::Config("rebuild.max_retries must be at least 1".to_string()));
        }
        if rebuild.max_concurrent == 0 {
            return Err(Error::Config("rebuild.max_concurrent must be at least 1".to_string()));
        }
        if rebuild.cycle_interval.is_zero() {
            return Err(Error::Config("rebuild.cycle_interval must be positive".to_string()));
        }
        self.teardown_timeout()?;

        for entry in &self.object_classes {
            if (entry.min_targets() as usize) < entry.class.total_shards() {
                return Err(Error::Config(format!(
                    "{} needs at least {} targets, min_targets is {}",
                    entry.class,
                    entry.class.total_shards(),
                    entry.min_targets()
                )));
            }
        }

        for (i, sizes) in self.transfer_sizes.iter().enumerate() {
            let [_, block, transfer] = self.transfer(i, sizes)?;
            if transfer == 0 || transfer > block {
                return Err(Error::Config(format!(
                    "transfer_sizes[{}]: transfer size {} must be in 1..={}",
                    i, transfer, block
                )));
            }
        }

        for (i, dataset) in self.datasets.iter().enumerate() {
            dataset.data_size.bytes()?;
            if dataset.object_qty == 0 || dataset.record_qty == 0 {
                return Err(Error::Config(format!(
                    "datasets[{}]: object_qty and record_qty must be at least 1",
                    i
                )));
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for rank in &self.fail_ranks {
            if *rank >= self.targets {
                return Err(Error::Config(format!(
                    "fail rank {} is outside the pool (targets: {})",
                    rank, self.targets
                )));
            }
            if !seen.insert(*rank) {
                return Err(Error::Config(format!("fail rank {} listed twice", rank)));
            }
        }

        Ok(())
    }

    fn transfer(&self, index: usize, sizes: &[Size; 3]) -> Result<[u64; 3]> {
        let mut out = [0u64; 3];
        for (slot, size) in out.iter_mut().zip(sizes) {
            *slot = size
                .bytes()
                .map_err(|e| Error::Config(format!("transfer_sizes[{}]: {}", index, e)))?;
        }
        Ok(out)
    }

    /// Parsed `[chunk, block, transfer]` triples.
    pub fn transfer_matrix(&self) -> Result<Vec<[u64; 3]>> {
        self.transfer_sizes
            .iter()
            .enumerate()
            .map(|(i, sizes)| self.transfer(i, sizes))
            .collect()
    }

    /// Classes that fit the configured target count. The rest are skipped.
    pub fn applicable_classes(&self) -> Vec<ObjectClass> {
        self.object_classes
            .iter()
            .filter(|entry| {
                let fits = entry.min_targets() <= self.targets;
                if !fits {
                    info!(
                        class = %entry.class,
                        min_targets = entry.min_targets(),
                        targets = self.targets,
                        "Skipping object class"
                    );
                }
                fits
            })
            .map(|entry| entry.class)
            .collect()
    }

    pub fn shard_fetch_timeout(&self) -> Result<Duration> {
        parse_duration(&self.store.shard_fetch_timeout)
    }

    pub fn teardown_timeout(&self) -> Result<Duration> {
        parse_duration(&self.rebuild.teardown_timeout)
    }

    pub fn rebuild_config(&self) -> Result<RebuildConfig> {
        Ok(RebuildConfig {
            max_retries: self.rebuild.max_retries,
            shard_fetch_timeout: self.shard_fetch_timeout()?,
            cycle_interval: parse_duration(&self.rebuild.cycle_interval)?,
            max_concurrent: self.rebuild.max_concurrent,
        })
    }
}

/// Parse a duration such as "30s", "5m", "1h30m" or "250ms".
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let overflow = || Error::DurationParse(format!("duration overflows: {}", s));
    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let millis = c.eq_ignore_ascii_case(&'m')
            && chars.peek().map(|n| n.eq_ignore_ascii_case(&'s')).unwrap_or(false);
        if millis {
            chars.next();
        }

        let unit_ms: u64 = match c.to_ascii_lowercase() {
            'm' if millis => 1,
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' => 60_000,
            's' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };
        total_ms = unit_ms
            .checked_mul(num)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(overflow)?;
    }

    // Trailing number without a unit is seconds
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(overflow)?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Parse a byte size such as "4096", "4K", "4KiB", "1MiB" or "2G".
///
/// Units are binary: K/KiB = 1024, M/MiB = 1024², G/GiB = 1024³.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);

    let num: u64 = digits
        .parse()
        .map_err(|_| Error::SizeParse(format!("invalid number in size: '{}'", s)))?;

    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" | "kib" => 1 << 10,
        "m" | "mb" | "mib" => 1 << 20,
        "g" | "gb" | "gib" => 1 << 30,
        other => return Err(Error::SizeParse(format!("unknown size unit: '{}'", other))),
    };

    num.checked_mul(multiplier)
        .ok_or_else(|| Error::SizeParse(format!("size overflows: '{}'", s)))
}
