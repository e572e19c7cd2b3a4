//! Prometheus metrics for pools and rebuild.
//!
//! Every `StoreMetrics` owns a private registry, so several pool managers can
//! live in one process (as they do in tests) without name clashes.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

const NAMESPACE: &str = "healpool";

fn prom_err(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

/// Counters for the object and rebuild paths.
#[derive(Clone)]
pub struct StoreMetrics {
    registry: Registry,
    pub objects_written: IntCounter,
    pub bytes_written: IntCounter,
    /// Reads by outcome: `ok`, `degraded`, `failed`
    pub reads: IntCounterVec,
    pub corrupt_shards: IntCounter,
    pub targets_failed: IntCounter,
    /// Rebuild task transitions by destination state
    pub rebuild_transitions: IntCounterVec,
    pub shards_reconstructed: IntCounter,
    /// Rebuild tasks currently executing
    pub rebuilds_in_flight: IntGauge,
}

impl std::fmt::Debug for StoreMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMetrics")
            .field("objects_written", &self.objects_written.get())
            .field("shards_reconstructed", &self.shards_reconstructed.get())
            .finish()
    }
}

impl StoreMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
                .map_err(prom_err)?;
            registry.register(Box::new(c.clone())).map_err(prom_err)?;
            Ok(c)
        };
        let counter_vec = |name: &str, help: &str, label: &str| -> Result<IntCounterVec> {
            let c = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), &[label])
                .map_err(prom_err)?;
            registry.register(Box::new(c.clone())).map_err(prom_err)?;
            Ok(c)
        };

        let objects_written = counter("objects_written_total", "Objects encoded and persisted")?;
        let bytes_written = counter("bytes_written_total", "Object bytes written before encoding")?;
        let reads = counter_vec("reads_total", "Object reads by outcome", "outcome")?;
        let corrupt_shards = counter("corrupt_shards_total", "Shards that failed checksum validation")?;
        let targets_failed = counter("targets_failed_total", "Targets marked failed")?;
        let rebuild_transitions = counter_vec(
            "rebuild_transitions_total",
            "Rebuild task state transitions by destination state",
            "state",
        )?;
        let shards_reconstructed =
            counter("shards_reconstructed_total", "Shards rebuilt onto a target and verified")?;

        let rebuilds_in_flight = IntGauge::with_opts(
            Opts::new("rebuilds_in_flight", "Rebuild tasks currently executing").namespace(NAMESPACE),
        )
        .map_err(prom_err)?;
        registry
            .register(Box::new(rebuilds_in_flight.clone()))
            .map_err(prom_err)?;

        Ok(Self {
            registry,
            objects_written,
            bytes_written,
            reads,
            corrupt_shards,
            targets_failed,
            rebuild_transitions,
            shards_reconstructed,
            rebuilds_in_flight,
        })
    }

    pub fn record_read(&self, outcome: &str) {
        self.reads.with_label_values(&[outcome]).inc();
    }

    pub fn record_transition(&self, state: &str) {
        self.rebuild_transitions.with_label_values(&[state]).inc();
    }

    pub fn transitions(&self, state: &str) -> u64 {
        self.rebuild_transitions.with_label_values(&[state]).get()
    }

    pub fn reads(&self, outcome: &str) -> u64 {
        self.reads.with_label_values(&[outcome]).get()
    }

    /// Render every metric in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prom_err)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_registries_do_not_clash() {
        let a = StoreMetrics::new().unwrap();
        let b = StoreMetrics::new().unwrap();

        a.objects_written.inc();
        assert_eq!(a.objects_written.get(), 1);
        assert_eq!(b.objects_written.get(), 0);
    }

    #[test]
    fn test_gather_text() {
        let metrics = StoreMetrics::new().unwrap();
        metrics.record_read("degraded");
        metrics.record_transition("Done");

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("healpool_reads_total{outcome=\"degraded\"} 1"));
        assert!(text.contains("healpool_rebuild_transitions_total{state=\"Done\"} 1"));
        assert_eq!(metrics.transitions("Done"), 1);
        assert_eq!(metrics.reads("ok"), 0);
    }
}
