//! In-memory Shard Store
//!
//! Volatile `ShardStore` for tests and dry runs. Uses DashMap for lock-free
//! concurrent access, and exposes fault-injection hooks for exercising the
//! read and rebuild paths: silent payload corruption and slow fetches.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::domain::ports::{
    ShardKey, ShardRecord, ShardStore, StoreFactory, StoreStats, TargetId,
};
use crate::error::{Error, Result};

/// In-memory shard store
#[derive(Default)]
pub struct InMemoryShardStore {
    shards: DashMap<ShardKey, ShardRecord>,
    /// Artificial delay applied to every `get`
    latency: RwLock<Option<Duration>>,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl std::fmt::Debug for InMemoryShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryShardStore")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl InMemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the bytes of a stored payload while keeping its recorded
    /// checksum. Returns false if the key is absent.
    pub fn corrupt(&self, key: &ShardKey) -> bool {
        match self.shards.get_mut(key) {
            Some(mut record) => {
                let flipped: Vec<u8> = record.payload.iter().map(|b| !b).collect();
                record.payload = Bytes::from(flipped);
                true
            }
            None => false,
        }
    }

    /// Delay every subsequent `get` by `latency` (`None` to clear).
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[async_trait]
impl ShardStore for InMemoryShardStore {
    async fn put(&self, record: &ShardRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let size = record.payload.len() as u64;
        if let Some(old) = self.shards.insert(record.key(), record.clone()) {
            self.total_bytes
                .fetch_sub(old.payload.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        Ok(())
    }

    async fn get(&self, key: &ShardKey) -> Result<ShardRecord> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let latency = *self.latency.read();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        self.shards
            .get(key)
            .map(|r| r.clone())
            .ok_or_else(|| Error::not_found("shard", key))
    }

    async fn delete(&self, key: &ShardKey) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);

        match self.shards.remove(key) {
            Some((_, old)) => {
                self.total_bytes
                    .fetch_sub(old.payload.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<ShardKey>> {
        let mut keys: Vec<ShardKey> = self.shards.iter().map(|e| *e.key()).collect();
        keys.sort();
        Ok(keys)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            shard_count: self.shards.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Hands out one `InMemoryShardStore` per target and keeps them reachable
/// so tests can inject faults into a specific target.
#[derive(Debug, Default)]
pub struct InMemoryStoreFactory {
    stores: DashMap<TargetId, Arc<InMemoryShardStore>>,
}

impl InMemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store opened for `target`, if any.
    pub fn store(&self, target: TargetId) -> Option<Arc<InMemoryShardStore>> {
        self.stores.get(&target).map(|s| Arc::clone(&s))
    }
}

impl StoreFactory for InMemoryStoreFactory {
    fn open(&self, target: TargetId) -> Result<Arc<dyn ShardStore>> {
        let store: Arc<dyn ShardStore> = self
            .stores
            .entry(target)
            .or_insert_with(|| Arc::new(InMemoryShardStore::new()))
            .clone();
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ObjectId, ShardKind};
    use assert_matches::assert_matches;

    fn record(payload: &'static [u8]) -> ShardRecord {
        ShardRecord {
            object_id: ObjectId::new(),
            shard_index: 0,
            kind: ShardKind::Data,
            checksum: crc32fast::hash(payload),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryShardStore::new();
        let rec = record(b"in memory");

        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.key()).await.unwrap(), rec);
        assert_eq!(store.stats().total_bytes, 9);

        assert!(store.delete(&rec.key()).await.unwrap());
        assert_matches!(store.get(&rec.key()).await, Err(Error::NotFound(_)));
        assert!(store.is_empty());
        assert_eq!(store.stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn test_corrupt_keeps_checksum() {
        let store = InMemoryShardStore::new();
        let rec = record(b"soon broken");
        store.put(&rec).await.unwrap();

        assert!(store.corrupt(&rec.key()));
        let got = store.get(&rec.key()).await.unwrap();
        assert_eq!(got.checksum, rec.checksum);
        assert!(!got.is_intact());
    }

    #[tokio::test]
    async fn test_latency_delays_get() {
        let store = InMemoryShardStore::new();
        let rec = record(b"slow");
        store.put(&rec).await.unwrap();
        store.set_latency(Some(Duration::from_millis(500)));

        let fetch = tokio::time::timeout(Duration::from_millis(20), store.get(&rec.key())).await;
        assert!(fetch.is_err());

        store.set_latency(None);
        assert!(store.get(&rec.key()).await.is_ok());
    }

    #[test]
    fn test_factory_reuses_store() {
        let factory = InMemoryStoreFactory::new();
        let target = TargetId::new(2);
        factory.open(target).unwrap();

        assert!(factory.store(target).is_some());
        assert!(factory.store(TargetId::new(3)).is_none());
        assert_eq!(factory.stores.len(), 1);
    }
}
