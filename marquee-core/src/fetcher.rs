//! On-demand range fetching and background whole-file downloads.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cache::{BlobRecord, BlobStore, CacheKey},
    error::{CacheError, Result},
    origin::{Origin, OriginRequest},
    range::{ByteRange, ByteRangeSpec},
    response::{CacheResponse, CacheStatus},
};

/// Default size of each range requested by background downloads and of
/// open-ended on-demand fetches.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Where the bytes for a key come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub key: CacheKey,
    pub url: Url,
    /// Used when the origin does not declare one.
    pub content_type: String,
}

/// A range obtained for a caller, from the origin or from a coalesced fetch.
#[derive(Clone)]
pub struct FetchedRange {
    pub range: ByteRange,
    /// Total blob size; 0 when the origin did not say.
    pub total: u64,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl fmt::Debug for FetchedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchedRange")
            .field("range", &self.range)
            .field("total", &self.total)
            .field("content_type", &self.content_type)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl FetchedRange {
    pub fn into_response(self) -> CacheResponse {
        let total = if self.total > 0 {
            self.total
        } else {
            self.range.end + 1
        };
        CacheResponse::partial(&self.content_type, self.range, total, self.body)
            .with_cache_status(CacheStatus::Fetched)
    }
}

/// Counters exposed on the status endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FetcherStats {
    pub ranges_fetched: u64,
    pub ranges_coalesced: u64,
    pub downloads_in_flight: usize,
}

type FlightMap = Arc<Mutex<HashMap<String, watch::Receiver<bool>>>>;

/// Fetches byte ranges that are not cached yet and runs whole-file downloads
/// in the background.
///
/// Identical concurrent range requests are coalesced: the first caller
/// fetches, later callers wait for it and read the persisted result.
/// Overlapping but different ranges fetch independently.
#[derive(Clone)]
pub struct ChunkFetcher {
    origin: Arc<dyn Origin>,
    chunk_size: u64,
    in_flight_ranges: FlightMap,
    /// Running downloads and the generation each one writes to.
    downloads: Arc<Mutex<HashMap<CacheKey, BlobStore>>>,
    ranges_fetched: Arc<AtomicU64>,
    ranges_coalesced: Arc<AtomicU64>,
}

impl fmt::Debug for ChunkFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkFetcher")
            .field("origin", &self.origin)
            .field("chunk_size", &self.chunk_size)
            .field("stats", &self.stats())
            .finish()
    }
}

enum Flight {
    Leader(FlightGuard),
    Follower(watch::Receiver<bool>),
}

/// Clears the in-flight entry and wakes followers when the leading fetch
/// finishes, fails or is dropped.
struct FlightGuard {
    map: FlightMap,
    key: String,
    done: watch::Sender<bool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(&self.key);
        }
        let _ = self.done.send(true);
    }
}

impl ChunkFetcher {
    pub fn new(origin: Arc<dyn Origin>, chunk_size: u64) -> Self {
        Self {
            origin,
            chunk_size: chunk_size.max(1),
            in_flight_ranges: Arc::new(Mutex::new(HashMap::new())),
            downloads: Arc::new(Mutex::new(HashMap::new())),
            ranges_fetched: Arc::new(AtomicU64::new(0)),
            ranges_coalesced: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn stats(&self) -> FetcherStats {
        FetcherStats {
            ranges_fetched: self.ranges_fetched.load(Ordering::Relaxed),
            ranges_coalesced: self.ranges_coalesced.load(Ordering::Relaxed),
            downloads_in_flight: self
                .downloads
                .lock()
                .map(|set| set.len())
                .unwrap_or(0),
        }
    }

    /// Forget downloads bound to a rolled-over generation. Their tasks stop
    /// at the next chunk boundary.
    pub fn forget_retired(&self) -> usize {
        let Ok(mut downloads) = self.downloads.lock() else {
            return 0;
        };
        let before = downloads.len();
        downloads.retain(|_, store| !store.is_retired());
        before - downloads.len()
    }

    /// Fetch `spec` of `target` from the origin, persist it, and return it.
    ///
    /// Open-ended requests are capped at one chunk. Cache write failures are
    /// logged and do not fail the fetch.
    pub async fn fetch_range(
        &self,
        store: &BlobStore,
        target: &FetchTarget,
        spec: ByteRangeSpec,
    ) -> Result<FetchedRange> {
        let spec = self.cap(spec);
        let flight_key = format!(
            "{}#{}#{}",
            store.root().as_path().display(),
            target.key,
            spec
        );

        match self.join_flight(&flight_key) {
            Flight::Leader(guard) => {
                let result = self.fetch_from_origin(store, target, spec).await;
                drop(guard);
                result
            }
            Flight::Follower(mut done) => {
                let _ = done.wait_for(|finished| *finished).await;
                if let Some(hit) = self.read_persisted(store, &target.key, spec).await {
                    return Ok(hit);
                }
                // Leader failed or could not persist; fetch ourselves.
                self.fetch_from_origin(store, target, spec).await
            }
        }
    }

    /// Start a background download of the whole file unless one is already
    /// running for the key. Never waits for the download.
    pub fn spawn_download(&self, store: BlobStore, target: FetchTarget) -> bool {
        if !self.try_begin_download(&store, &target.key) {
            return false;
        }

        let fetcher = self.clone();
        tokio::spawn(async move {
            info!(key = %target.key, url = %target.url, "background download started");
            match fetcher.download_whole(&store, &target).await {
                Ok(record) => info!(
                    key = %target.key,
                    bytes = record.size_bytes,
                    "background download complete"
                ),
                Err(CacheError::Retired(_)) => info!(
                    key = %target.key,
                    "background download dropped with its cache generation"
                ),
                Err(err) => warn!(
                    key = %target.key,
                    error = %err,
                    "background download aborted"
                ),
            }
            fetcher.finish_download(&store, &target.key);
        });
        true
    }

    /// Download every missing chunk of `target` in order, skipping ranges
    /// that on-demand fetches already persisted. Stops once the store's
    /// generation is rolled over.
    pub async fn download_whole(
        &self,
        store: &BlobStore,
        target: &FetchTarget,
    ) -> Result<BlobRecord> {
        let mut start = 0u64;
        let mut total = 0u64;

        loop {
            if store.is_retired() {
                return Err(CacheError::Retired(target.key.to_string()));
            }
            if let Some(record) = store.record(&target.key).await? {
                if record.is_complete() {
                    return Ok(record);
                }
                total = total.max(record.size_bytes);
                if let Some(run) = record.covered_run_from(start) {
                    start = run.end + 1;
                }
                if record.size_bytes > 0 && start >= record.size_bytes {
                    return Err(CacheError::Internal(format!(
                        "{} reached its end without becoming complete",
                        target.key
                    )));
                }
            }

            let requested = ByteRangeSpec::From {
                start,
                end: Some(start + self.chunk_size - 1),
            };
            let fetched = match self.fetch_range(store, target, requested).await {
                Ok(fetched) => fetched,
                // Unknown size and a length that is a multiple of the chunk
                // size: the first range past the end is rejected.
                Err(CacheError::InvalidRange(_)) if start > 0 && total == 0 => {
                    debug!(key = %target.key, size = start, "origin reported end of file");
                    return self.seal_unknown_size(store, &target.key, start).await;
                }
                Err(err) => return Err(err),
            };
            total = total.max(fetched.total);
            if fetched.range.start > start || fetched.range.end < start {
                return Err(CacheError::Origin(format!(
                    "asked for {requested} of {}, got {:?}",
                    target.url, fetched.range
                )));
            }

            if fetched.total == 0 && fetched.range.len() < self.chunk_size {
                // The origin never declared a size; a short chunk is the end.
                return self
                    .seal_unknown_size(store, &target.key, fetched.range.end + 1)
                    .await;
            }
            start = fetched.range.end + 1;
        }
    }

    async fn fetch_from_origin(
        &self,
        store: &BlobStore,
        target: &FetchTarget,
        spec: ByteRangeSpec,
    ) -> Result<FetchedRange> {
        let issued = store.next_issue();
        let response = self
            .origin
            .fetch(OriginRequest::get(target.url.clone()).with_range(spec))
            .await?;
        self.ranges_fetched.fetch_add(1, Ordering::Relaxed);

        let content_type = response
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| target.content_type.clone());

        match response.status {
            StatusCode::PARTIAL_CONTENT => {
                let (range, total) = response.content_range().ok_or_else(|| {
                    CacheError::Origin(format!(
                        "{} answered 206 without content-range",
                        target.url
                    ))
                })?;
                if response.body.len() as u64 != range.len() {
                    return Err(CacheError::Origin(format!(
                        "{} sent {} bytes for {:?}",
                        target.url,
                        response.body.len(),
                        range
                    )));
                }
                let total = total.unwrap_or(0);

                if let Err(err) = store
                    .append_range(
                        &target.key,
                        &content_type,
                        total,
                        range.start,
                        &response.body,
                        issued,
                    )
                    .await
                {
                    warn!(key = %target.key, error = %err, "failed to persist fetched range");
                }
                debug!(key = %target.key, ?range, total, "fetched range from origin");

                Ok(FetchedRange {
                    range,
                    total,
                    content_type,
                    body: response.body,
                })
            }
            StatusCode::OK => {
                // The origin ignored Range and sent everything.
                let total = response.body.len() as u64;
                if let Err(err) = store
                    .put_complete(&target.key, &content_type, &response.body)
                    .await
                {
                    warn!(key = %target.key, error = %err, "failed to persist full body");
                }
                let range = spec
                    .resolve(total)
                    .map_err(|e| CacheError::InvalidRange(e.to_string()))?;
                let from = range.start as usize;
                let to = range.end as usize;
                let body = response.body[from..=to].to_vec();

                Ok(FetchedRange {
                    range,
                    total,
                    content_type,
                    body,
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(CacheError::InvalidRange(
                format!("{} rejected {spec}", target.url),
            )),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                Err(CacheError::NotFound(target.url.to_string()))
            }
            status => Err(CacheError::Origin(format!(
                "{} answered {status}",
                target.url
            ))),
        }
    }

    async fn read_persisted(
        &self,
        store: &BlobStore,
        key: &CacheKey,
        spec: ByteRangeSpec,
    ) -> Option<FetchedRange> {
        let record = store.record(key).await.ok()??;
        let range = spec.resolve(record.size_bytes).ok()?;
        let body = store.read_range(&record, range).await.ok()??;
        Some(FetchedRange {
            range,
            total: record.size_bytes,
            content_type: record.content_type,
            body,
        })
    }

    async fn seal_unknown_size(
        &self,
        store: &BlobStore,
        key: &CacheKey,
        size: u64,
    ) -> Result<BlobRecord> {
        let record = store
            .record(key)
            .await?
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        let payload = store
            .read_range(
                &record,
                ByteRange {
                    start: 0,
                    end: size - 1,
                },
            )
            .await?
            .ok_or_else(|| {
                CacheError::Internal(format!("{key} has gaps below {size}"))
            })?;
        store.put_complete(key, &record.content_type, &payload).await
    }

    fn cap(&self, spec: ByteRangeSpec) -> ByteRangeSpec {
        match spec {
            ByteRangeSpec::From { start, end: None } => ByteRangeSpec::From {
                start,
                end: Some(start + self.chunk_size - 1),
            },
            other => other,
        }
    }

    fn join_flight(&self, key: &str) -> Flight {
        let mut map = match self.in_flight_ranges.lock() {
            Ok(map) => map,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(done) = map.get(key) {
            let waiters = self.ranges_coalesced.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(key, waiters, "range fetch coalesced");
            return Flight::Follower(done.clone());
        }

        let (done, receiver) = watch::channel(false);
        map.insert(key.to_string(), receiver);
        Flight::Leader(FlightGuard {
            map: Arc::clone(&self.in_flight_ranges),
            key: key.to_string(),
            done,
        })
    }

    /// Claim `key` for a download into `store`. A claim held by an older
    /// generation does not block the new one.
    fn try_begin_download(&self, store: &BlobStore, key: &CacheKey) -> bool {
        let Ok(mut downloads) = self.downloads.lock() else {
            return false;
        };
        if let Some(running) = downloads.get(key)
            && running.same_generation(store)
            && !running.is_retired()
        {
            return false;
        }
        downloads.insert(key.clone(), store.clone());
        true
    }

    fn finish_download(&self, store: &BlobStore, key: &CacheKey) {
        if let Ok(mut downloads) = self.downloads.lock()
            && downloads
                .get(key)
                .is_some_and(|running| running.same_generation(store))
        {
            downloads.remove(key);
        }
    }
}
