use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use cacache::Integrity;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, RwLockReadGuard};
use tracing::debug;

use super::{
    key::CacheKey,
    record::{BlobRecord, ChunkRef, Completeness},
};
use crate::{
    error::{CacheError, Result},
    range::ByteRange,
};

/// Root directory of one cache generation.
///
/// `cacache` manages the directory internally (index + content-addressed
/// blobs).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheRoot(PathBuf);

impl CacheRoot {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for CacheRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheRoot").field(&self.0).finish()
    }
}

type KeyLocks = Arc<DashMap<CacheKey, Arc<Mutex<()>>>>;

/// Write gate of one generation. Writers hold a read guard for the whole
/// operation; retiring takes the write side, so once `retire` returns no
/// write can touch the directory again.
#[derive(Debug, Default)]
struct Liveness {
    retired: AtomicBool,
    writers: RwLock<()>,
}

/// Per-key manifest lock. The map entry is dropped with the last holder.
struct KeyLockGuard {
    locks: KeyLocks,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Persistent keyed blob store.
///
/// Payload bytes are written in "hash-only" mode and referenced from a
/// per-key manifest ([`BlobRecord`]). Chunks are always written before the
/// manifest that points at them, and manifest updates for a key are
/// serialized by a per-key lock, so a record is only ever exposed once its
/// new range is fully on disk.
///
/// Clones share one generation. After [`BlobStore::retire`] every write
/// fails with [`CacheError::Retired`].
#[derive(Clone)]
pub struct BlobStore {
    root: CacheRoot,
    key_locks: KeyLocks,
    issue_seq: Arc<AtomicU64>,
    liveness: Arc<Liveness>,
}

impl fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStore")
            .field("root", &self.root)
            .field("locked_keys", &self.key_locks.len())
            .field("issue_seq", &self.issue_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl BlobStore {
    pub fn new(root: CacheRoot) -> Self {
        Self {
            root,
            key_locks: Arc::new(DashMap::new()),
            issue_seq: Arc::new(AtomicU64::new(0)),
            liveness: Arc::new(Liveness::default()),
        }
    }

    /// True once the generation behind this store was rolled over.
    pub fn is_retired(&self) -> bool {
        self.liveness.retired.load(Ordering::Acquire)
    }

    /// True when both handles write to the same generation.
    pub fn same_generation(&self, other: &BlobStore) -> bool {
        Arc::ptr_eq(&self.liveness, &other.liveness)
    }

    /// Refuse further writes, waiting for writes already in progress.
    pub(crate) async fn retire(&self) {
        self.liveness.retired.store(true, Ordering::Release);
        let _drained = self.liveness.writers.write().await;
    }

    pub fn root(&self) -> &CacheRoot {
        &self.root
    }

    /// Sequence number for a range fetch about to be issued. Used to order
    /// overlapping completions.
    pub fn next_issue(&self) -> u64 {
        self.issue_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up the record for `key`. `Ok(None)` means nothing was ever written.
    pub async fn record(&self, key: &CacheKey) -> Result<Option<BlobRecord>> {
        match cacache::read(self.root.as_path(), key.manifest_key()).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(cacache::Error::EntryNotFound(_, _)) => Ok(None),
            Err(err) => Err(map_read_error(err, &key.to_string())),
        }
    }

    /// Replace whatever is stored under `key` with a complete payload.
    pub async fn put_complete(
        &self,
        key: &CacheKey,
        content_type: &str,
        bytes: &[u8],
    ) -> Result<BlobRecord> {
        let _live = self.write_gate().await?;
        let integrity = self.write_chunk(bytes).await?;
        let _guard = self.lock_key(key).await;

        let mut record =
            BlobRecord::empty(key.clone(), content_type, bytes.len() as u64);
        record.completeness = Completeness::Complete;
        if !bytes.is_empty() {
            record.chunks.push(ChunkRef {
                start: 0,
                end: bytes.len() as u64 - 1,
                integrity: integrity.to_string(),
                issued: self.next_issue(),
            });
        }

        self.write_record(&record).await?;
        debug!(key = %key, bytes = bytes.len(), "stored complete blob");
        Ok(record)
    }

    /// Append a fetched range to the record for `key`, creating a partial
    /// record if none exists. The record is promoted to complete once every
    /// byte of `total_size` is present.
    pub async fn append_range(
        &self,
        key: &CacheKey,
        content_type: &str,
        total_size: u64,
        start: u64,
        bytes: &[u8],
        issued: u64,
    ) -> Result<BlobRecord> {
        if bytes.is_empty() {
            return Err(CacheError::InvalidRange(format!(
                "empty chunk for {key} at offset {start}"
            )));
        }
        let end = start + bytes.len() as u64 - 1;
        if total_size > 0 && end >= total_size {
            return Err(CacheError::InvalidRange(format!(
                "chunk {start}-{end} exceeds total size {total_size} for {key}"
            )));
        }

        let _live = self.write_gate().await?;
        let integrity = self.write_chunk(bytes).await?;
        let _guard = self.lock_key(key).await;

        let mut record = match self.record(key).await? {
            Some(existing) if existing.is_complete() => return Ok(existing),
            Some(existing) => existing,
            None => BlobRecord::empty(key.clone(), content_type, total_size),
        };
        if record.size_bytes == 0 {
            record.size_bytes = total_size;
        }
        if record.content_type.is_empty() {
            record.content_type = content_type.to_string();
        }

        let changed = record.insert_chunk(ChunkRef {
            start,
            end,
            integrity: integrity.to_string(),
            issued,
        });
        if !changed {
            return Ok(record);
        }

        if record.is_fully_covered() {
            record = self.consolidate(record).await?;
            debug!(key = %key, size = record.size_bytes, "promoted blob to complete");
        }

        self.write_record(&record).await?;
        Ok(record)
    }

    /// Read `range` from the persisted chunks of `record`. `Ok(None)` when any
    /// byte of the range has not been persisted yet.
    pub async fn read_range(
        &self,
        record: &BlobRecord,
        range: ByteRange,
    ) -> Result<Option<Vec<u8>>> {
        let Some(steps) = record.plan_read(range) else {
            return Ok(None);
        };

        let mut out = Vec::with_capacity(usize_len(range.len())?);
        for step in steps {
            let chunk = self.read_chunk(&step.integrity).await?;
            let from = usize_len(step.offset)?;
            let to = from + usize_len(step.len)?;
            let slice = chunk.get(from..to).ok_or_else(|| {
                CacheError::Integrity(format!(
                    "chunk {} shorter than recorded ({} < {to})",
                    step.integrity,
                    chunk.len()
                ))
            })?;
            out.extend_from_slice(slice);
        }
        Ok(Some(out))
    }

    /// Whole payload of a complete record.
    pub async fn read_all(&self, record: &BlobRecord) -> Result<Vec<u8>> {
        if !record.is_complete() {
            return Err(CacheError::NotFound(format!(
                "{} is only partially cached",
                record.key
            )));
        }
        if record.size_bytes == 0 {
            return Ok(Vec::new());
        }
        self.read_range(
            record,
            ByteRange {
                start: 0,
                end: record.size_bytes - 1,
            },
        )
        .await?
        .ok_or_else(|| {
            CacheError::Integrity(format!(
                "{} is marked complete but has gaps",
                record.key
            ))
        })
    }

    async fn consolidate(&self, mut record: BlobRecord) -> Result<BlobRecord> {
        let payload = self
            .read_range(
                &record,
                ByteRange {
                    start: 0,
                    end: record.size_bytes - 1,
                },
            )
            .await?
            .ok_or_else(|| {
                CacheError::Internal(format!(
                    "{} lost coverage during promotion",
                    record.key
                ))
            })?;
        let integrity = self.write_chunk(&payload).await?;

        record.chunks = vec![ChunkRef {
            start: 0,
            end: record.size_bytes - 1,
            integrity: integrity.to_string(),
            issued: self.next_issue(),
        }];
        record.completeness = Completeness::Complete;
        record.updated_at = Utc::now();
        Ok(record)
    }

    async fn write_record(&self, record: &BlobRecord) -> Result<()> {
        let encoded = serde_json::to_vec(record)?;
        cacache::write(self.root.as_path(), record.key.manifest_key(), encoded)
            .await
            .map(|_| ())
            .map_err(|e| {
                CacheError::Internal(format!("cacache write failed: {e}"))
            })
    }

    async fn write_chunk(&self, bytes: &[u8]) -> Result<Integrity> {
        cacache::write_hash(self.root.as_path(), bytes)
            .await
            .map_err(|e| {
                CacheError::Internal(format!("cacache write_hash failed: {e}"))
            })
    }

    async fn read_chunk(&self, integrity: &str) -> Result<Vec<u8>> {
        let hash = integrity.parse::<Integrity>().map_err(|e| {
            CacheError::Integrity(format!("bad integrity {integrity}: {e}"))
        })?;
        cacache::read_hash(self.root.as_path(), &hash)
            .await
            .map_err(|e| map_read_error(e, integrity))
    }

    async fn write_gate(&self) -> Result<RwLockReadGuard<'_, ()>> {
        let guard = self.liveness.writers.read().await;
        if self.is_retired() {
            return Err(CacheError::Retired(
                self.root.as_path().display().to_string(),
            ));
        }
        Ok(guard)
    }

    async fn lock_key(&self, key: &CacheKey) -> KeyLockGuard {
        let lock = self.key_locks.entry(key.clone()).or_default().clone();
        KeyLockGuard {
            locks: Arc::clone(&self.key_locks),
            key: key.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

fn usize_len(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| {
        CacheError::InvalidRange(format!("{value} bytes exceeds address space"))
    })
}

fn map_read_error(err: cacache::Error, what: &str) -> CacheError {
    match err {
        cacache::Error::EntryNotFound(_, _) => {
            CacheError::NotFound(format!("cache entry not found: {what}"))
        }
        cacache::Error::IntegrityError(err) => {
            CacheError::Integrity(format!("{what} ({err})"))
        }
        cacache::Error::SizeMismatch(wanted, actual) => {
            CacheError::Integrity(format!(
                "size mismatch: entry={what}, wanted={wanted}, actual={actual}"
            ))
        }
        cacache::Error::IoError(_, msg) => {
            CacheError::Internal(format!("cacache read I/O error: {msg}"))
        }
        cacache::Error::SerdeError(_, msg) => {
            CacheError::Internal(format!("cacache read serde error: {msg}"))
        }
    }
}
