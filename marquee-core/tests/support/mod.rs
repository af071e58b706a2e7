#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use marquee_core::{
    CacheError, CacheManager, ChunkFetcher, Classifier, Origin, OriginRequest, OriginResponse,
    RequestRouter, RequiredFiles, RouterSettings,
    range::ByteRangeSpec,
};
use reqwest::{
    Method, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use tempfile::TempDir;
use url::Url;

pub const BASE: &str = "https://cms.test/";

/// In-memory origin that records every request it receives.
#[derive(Debug, Default)]
pub struct RecordingOrigin {
    files: Mutex<HashMap<String, (String, Vec<u8>)>>,
    requests: Mutex<Vec<(Method, String, Option<String>)>>,
    offline: AtomicBool,
    ignore_ranges: AtomicBool,
    hide_total: AtomicBool,
    delay_ms: AtomicUsize,
}

impl RecordingOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body` at `target` (path plus optional query, no leading slash).
    pub fn serve(&self, target: &str, content_type: &str, body: Vec<u8>) {
        self.files
            .lock()
            .unwrap()
            .insert(target.to_string(), (content_type.to_string(), body));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_ignore_ranges(&self, ignore: bool) {
        self.ignore_ranges.store(ignore, Ordering::SeqCst);
    }

    /// Answer ranges with `content-range: bytes S-E/*`.
    pub fn set_hide_total(&self, hide: bool) {
        self.hide_total.store(hide, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<(Method, String, Option<String>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn range_requests(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|(_, _, range)| range)
            .collect()
    }

    fn target_of(url: &Url) -> String {
        let path = url.path().trim_start_matches('/');
        match url.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }
}

#[async_trait]
impl Origin for RecordingOrigin {
    async fn fetch(&self, request: OriginRequest) -> marquee_core::Result<OriginResponse> {
        let target = Self::target_of(&request.url);
        self.requests.lock().unwrap().push((
            request.method.clone(),
            target.clone(),
            request.range.map(|r| r.to_string()),
        ));

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Origin("connection refused".into()));
        }

        let Some((content_type, body)) = self.files.lock().unwrap().get(&target).cloned() else {
            return Ok(OriginResponse {
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                body: Vec::new(),
            });
        };

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
        let total = body.len() as u64;

        match request.range {
            Some(spec) if !self.ignore_ranges.load(Ordering::SeqCst) => match spec.resolve(total) {
                Ok(range) => {
                    let content_range = if self.hide_total.load(Ordering::SeqCst) {
                        format!("bytes {}-{}/*", range.start, range.end)
                    } else {
                        range.content_range(total)
                    };
                    headers.insert(
                        header::CONTENT_RANGE,
                        HeaderValue::from_str(&content_range).unwrap(),
                    );
                    Ok(OriginResponse {
                        status: StatusCode::PARTIAL_CONTENT,
                        headers,
                        body: body[range.start as usize..=range.end as usize].to_vec(),
                    })
                }
                Err(_) => Ok(OriginResponse {
                    status: StatusCode::RANGE_NOT_SATISFIABLE,
                    headers,
                    body: Vec::new(),
                }),
            },
            _ => Ok(OriginResponse {
                status: StatusCode::OK,
                headers,
                body,
            }),
        }
    }
}

/// Deterministic payload: byte `i` is `i % 251`.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn range(start: u64, end: u64) -> ByteRangeSpec {
    ByteRangeSpec::From {
        start,
        end: Some(end),
    }
}

pub struct Harness {
    pub _dir: TempDir,
    pub cache: Arc<CacheManager>,
    pub required: Arc<RequiredFiles>,
    pub origin: Arc<RecordingOrigin>,
    pub fetcher: ChunkFetcher,
    pub router: RequestRouter,
}

pub async fn harness(chunk_size: u64) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(CacheManager::open(dir.path(), "v1").await.unwrap());
    let required = Arc::new(RequiredFiles::new());
    let origin = RecordingOrigin::new();
    let fetcher = ChunkFetcher::new(origin.clone(), chunk_size);
    let router = RequestRouter::new(
        cache.clone(),
        required.clone(),
        origin.clone(),
        fetcher.clone(),
        Classifier::default(),
        RouterSettings {
            origin_base: Url::parse(BASE).unwrap(),
            retry_after: Duration::from_secs(2),
        },
    );
    Harness {
        _dir: dir,
        cache,
        required,
        origin,
        fetcher,
        router,
    }
}

/// Make every cache write of the active generation fail while existing
/// entries stay readable: cacache stages writes under `tmp/`.
pub async fn break_cache_writes(h: &Harness) {
    let generation = h.cache.generation().await;
    let tmp = h.cache.base().join(generation).join("tmp");
    let _ = tokio::fs::remove_dir_all(&tmp).await;
    tokio::fs::write(&tmp, b"").await.unwrap();
}

pub async fn wait_for_downloads(fetcher: &ChunkFetcher) {
    for _ in 0..500 {
        if fetcher.stats().downloads_in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("downloads never finished");
}
