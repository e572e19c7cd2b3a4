//! File-backed Shard Store
//!
//! Durable `ShardStore` with one directory per target and one file per shard:
//!
//! ```text
//! <root>/<object-id>/<shard-index>.shard
//! ```
//!
//! Each file holds a fixed little-endian header followed by the payload:
//!
//! ```text
//! magic "HPSH" | version u8 | kind u8 | reserved u16 | shard_index u32
//! checksum u32 | object_id [16] | payload_len u64 | payload ...
//! ```
//!
//! Writes go to a temporary file which is synced and then renamed over the
//! final path, so readers observe the old record or the new one, never a torn
//! write.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::ports::{
    ObjectId, ShardKey, ShardKind, ShardRecord, ShardStore, StoreFactory, StoreStats, TargetId,
};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"HPSH";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4 + 4 + 16 + 8;
const SHARD_EXT: &str = "shard";

/// Encode a record into its on-disk form.
fn encode_record(record: &ShardRecord) -> Result<Bytes> {
    let index = u32::try_from(record.shard_index)
        .map_err(|_| Error::Internal(format!("shard index {} too large", record.shard_index)))?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + record.payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(record.kind.to_byte());
    buf.put_u16_le(0);
    buf.put_u32_le(index);
    buf.put_u32_le(record.checksum);
    buf.put_slice(record.object_id.as_uuid().as_bytes());
    buf.put_u64_le(record.payload.len() as u64);
    buf.put_slice(&record.payload);
    Ok(buf.freeze())
}

/// Parse a record from its on-disk form.
fn decode_record(mut raw: Bytes) -> Result<ShardRecord> {
    let malformed = |reason: &str| Error::Internal(format!("malformed shard file: {}", reason));

    if raw.len() < HEADER_LEN {
        return Err(malformed("truncated header"));
    }
    if &raw[..4] != MAGIC {
        return Err(malformed("bad magic"));
    }
    raw.advance(4);

    let version = raw.get_u8();
    if version != VERSION {
        return Err(malformed(&format!("unsupported version {}", version)));
    }
    let kind = ShardKind::from_byte(raw.get_u8()).ok_or_else(|| malformed("bad shard kind"))?;
    raw.advance(2);
    let shard_index = raw.get_u32_le() as usize;
    let checksum = raw.get_u32_le();

    let mut id = [0u8; 16];
    raw.copy_to_slice(&mut id);
    let object_id = ObjectId(Uuid::from_bytes(id));

    let payload_len = raw.get_u64_le() as usize;
    if raw.len() != payload_len {
        return Err(malformed("payload length mismatch"));
    }

    Ok(ShardRecord {
        object_id,
        shard_index,
        kind,
        checksum,
        payload: raw,
    })
}

/// Durable shard store rooted at one directory.
pub struct FileShardStore {
    root: PathBuf,
    shard_count: AtomicU64,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl std::fmt::Debug for FileShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileShardStore")
            .field("root", &self.root)
            .finish()
    }
}

impl FileShardStore {
    /// Open (creating if needed) a store at `root`, picking up any shards
    /// already present from a previous run.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let (count, bytes) = scan_existing(&root)?;
        debug!(root = %root.display(), shards = count, "Opened file shard store");

        Ok(Self {
            root,
            shard_count: AtomicU64::new(count),
            total_bytes: AtomicU64::new(bytes),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_dir(&self, object_id: &ObjectId) -> PathBuf {
        self.root.join(object_id.to_string())
    }

    fn shard_path(&self, key: &ShardKey) -> PathBuf {
        self.object_dir(&key.object_id)
            .join(format!("{}.{}", key.shard_index, SHARD_EXT))
    }
}

fn scan_existing(root: &Path) -> Result<(u64, u64)> {
    let mut count = 0;
    let mut bytes = 0;
    for dir in std::fs::read_dir(root)? {
        let dir = dir?;
        if !dir.file_type()?.is_dir() {
            continue;
        }
        for file in std::fs::read_dir(dir.path())? {
            let file = file?;
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) == Some(SHARD_EXT) {
                count += 1;
                bytes += file.metadata()?.len().saturating_sub(HEADER_LEN as u64);
            }
        }
    }
    Ok((count, bytes))
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir).await?.sync_all().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl ShardStore for FileShardStore {
    #[instrument(skip(self, record), fields(key = %record.key()))]
    async fn put(&self, record: &ShardRecord) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let key = record.key();
        let dir = self.object_dir(&key.object_id);
        fs::create_dir_all(&dir).await?;

        let path = self.shard_path(&key);
        let previous = match fs::metadata(&path).await {
            Ok(meta) => Some(meta.len().saturating_sub(HEADER_LEN as u64)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        // Write to temporary file first, then rename for atomicity
        let encoded = encode_record(record)?;
        let temp_path = path.with_extension(format!("{}.tmp", SHARD_EXT));
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &path).await?;
        sync_dir(&dir).await?;

        let size = record.payload.len() as u64;
        match previous {
            Some(old) => {
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
                self.total_bytes.fetch_sub(old, Ordering::Relaxed);
            }
            None => {
                self.shard_count.fetch_add(1, Ordering::Relaxed);
                self.total_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }

        Ok(())
    }

    async fn get(&self, key: &ShardKey) -> Result<ShardRecord> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        let raw = match fs::read(self.shard_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found("shard", key));
            }
            Err(e) => return Err(e.into()),
        };

        let record = decode_record(Bytes::from(raw))?;
        if record.key() != *key {
            return Err(Error::Internal(format!(
                "shard file for {} holds {}",
                key,
                record.key()
            )));
        }
        Ok(record)
    }

    async fn delete(&self, key: &ShardKey) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);

        let path = self.shard_path(key);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len().saturating_sub(HEADER_LEN as u64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        fs::remove_file(&path).await?;
        self.shard_count.fetch_sub(1, Ordering::Relaxed);
        self.total_bytes.fetch_sub(size, Ordering::Relaxed);

        // Only succeeds once the object directory is empty.
        let _ = fs::remove_dir(self.object_dir(&key.object_id)).await;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<ShardKey>> {
        let mut keys = Vec::new();
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(dir) = dirs.next_entry().await? {
            let Some(object_id) = dir
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<ObjectId>().ok())
            else {
                continue;
            };

            let mut files = fs::read_dir(dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(SHARD_EXT) {
                    continue;
                }
                if let Some(index) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<usize>().ok())
                {
                    keys.push(ShardKey::new(object_id, index));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            shard_count: self.shard_count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Opens a `FileShardStore` per target under `<root>/target-<rank>`.
#[derive(Debug, Clone)]
pub struct FileStoreFactory {
    root: PathBuf,
}

impl FileStoreFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn target_dir(&self, target: TargetId) -> PathBuf {
        self.root.join(format!("target-{}", target.rank()))
    }
}

impl StoreFactory for FileStoreFactory {
    fn open(&self, target: TargetId) -> Result<Arc<dyn ShardStore>> {
        let store: Arc<dyn ShardStore> = Arc::new(FileShardStore::open(self.target_dir(target))?);
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn record(object_id: ObjectId, index: usize, payload: &'static [u8]) -> ShardRecord {
        ShardRecord {
            object_id,
            shard_index: index,
            kind: ShardKind::for_index(index, 2),
            checksum: crc32fast::hash(payload),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_record_codec_roundtrip() {
        let rec = record(ObjectId::new(), 2, b"parity bytes");
        let decoded = decode_record(encode_record(&rec).unwrap()).unwrap();
        assert_eq!(decoded, rec);
    }

    #[test]
    fn test_decode_rejects_truncated_and_bad_magic() {
        let rec = record(ObjectId::new(), 0, b"data");
        let encoded = encode_record(&rec).unwrap();

        assert!(decode_record(encoded.slice(..HEADER_LEN - 1)).is_err());
        assert!(decode_record(encoded.slice(..encoded.len() - 1)).is_err());

        let mut bad = encoded.to_vec();
        bad[0] = b'X';
        assert!(decode_record(Bytes::from(bad)).is_err());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileShardStore::open(dir.path()).unwrap();
        let rec = record(ObjectId::new(), 1, b"hello-world");

        store.put(&rec).await.unwrap();
        assert_eq!(store.get(&rec.key()).await.unwrap(), rec);
        assert_eq!(store.keys().await.unwrap(), vec![rec.key()]);
        assert_eq!(store.stats().shard_count, 1);
        assert_eq!(store.stats().total_bytes, 11);

        assert!(store.delete(&rec.key()).await.unwrap());
        assert!(!store.delete(&rec.key()).await.unwrap());
        assert_matches!(store.get(&rec.key()).await, Err(Error::NotFound(_)));
        assert_eq!(store.stats().shard_count, 0);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileShardStore::open(dir.path()).unwrap();
        let object_id = ObjectId::new();

        store.put(&record(object_id, 0, b"first")).await.unwrap();
        store.put(&record(object_id, 0, b"second!")).await.unwrap();

        let got = store.get(&ShardKey::new(object_id, 0)).await.unwrap();
        assert_eq!(got.payload, Bytes::from_static(b"second!"));
        assert_eq!(store.stats().shard_count, 1);
        assert_eq!(store.stats().total_bytes, 7);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let rec = record(ObjectId::new(), 0, b"durable");
        {
            let store = FileShardStore::open(dir.path()).unwrap();
            store.put(&rec).await.unwrap();
        }

        let reopened = FileShardStore::open(dir.path()).unwrap();
        assert_eq!(reopened.stats().shard_count, 1);
        assert_eq!(reopened.get(&rec.key()).await.unwrap(), rec);
    }

    #[tokio::test]
    async fn test_factory_separates_targets() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileStoreFactory::new(dir.path());
        let a = factory.open(TargetId::new(0)).unwrap();
        let b = factory.open(TargetId::new(1)).unwrap();

        let rec = record(ObjectId::new(), 0, b"only on a");
        a.put(&rec).await.unwrap();

        assert!(a.get(&rec.key()).await.is_ok());
        assert_matches!(b.get(&rec.key()).await, Err(Error::NotFound(_)));
    }
}
