//! Ingest side for the collection/sync process.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    cache::{BlobRecord, CacheKey, CacheManager, KeyKind},
    error::Result,
    fetcher::{ChunkFetcher, FetchTarget},
    media_type::content_type_for,
    required::{FileDescriptor, RequiredFiles},
};

/// Outcome of announcing a required set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub registered: usize,
    pub newly_known: usize,
    pub already_cached: usize,
    pub downloads_started: usize,
}

#[derive(Debug, Clone)]
pub struct SyncIngest {
    cache: Arc<CacheManager>,
    required: Arc<RequiredFiles>,
    fetcher: ChunkFetcher,
}

impl SyncIngest {
    pub fn new(
        cache: Arc<CacheManager>,
        required: Arc<RequiredFiles>,
        fetcher: ChunkFetcher,
    ) -> Self {
        Self {
            cache,
            required,
            fetcher,
        }
    }

    /// Record the required set and start background downloads for anything
    /// not fully cached yet.
    pub async fn register(&self, descriptors: Vec<FileDescriptor>) -> Result<SyncReport> {
        let store = self.cache.store().await;
        let mut report = SyncReport {
            registered: descriptors.len(),
            newly_known: self.required.register(descriptors.iter().cloned()),
            ..SyncReport::default()
        };

        for descriptor in descriptors {
            if let Some(record) = store.record(&descriptor.key).await?
                && record.is_complete()
            {
                report.already_cached += 1;
                continue;
            }
            let target = FetchTarget {
                key: descriptor.key.clone(),
                content_type: descriptor.resolved_content_type(),
                url: descriptor.url,
            };
            if self.fetcher.spawn_download(store.clone(), target) {
                report.downloads_started += 1;
            }
        }

        info!(
            registered = report.registered,
            new = report.newly_known,
            cached = report.already_cached,
            downloads = report.downloads_started,
            "required files registered"
        );
        Ok(report)
    }

    /// Store a complete blob pushed directly by the sync process.
    pub async fn push_blob(
        &self,
        key: &CacheKey,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<BlobRecord> {
        let content_type = match content_type {
            Some(content_type) => content_type.to_string(),
            None => self
                .required
                .get(key)
                .map(|d| d.resolved_content_type())
                .unwrap_or_else(|| match key.kind() {
                    KeyKind::Widget => content_type_for("html").to_string(),
                    _ => content_type_for("").to_string(),
                }),
        };
        let record = self
            .cache
            .store()
            .await
            .put_complete(key, &content_type, bytes)
            .await?;
        debug!(key = %key, bytes = bytes.len(), "blob pushed by sync");
        Ok(record)
    }

    /// Switch cache generation. Announcements belong to the old generation
    /// and are dropped with it.
    pub async fn rollover(&self, generation: &str) -> Result<bool> {
        let switched = self.cache.rollover(generation).await?;
        if switched {
            self.required.clear();
            let dropped = self.fetcher.forget_retired();
            if dropped > 0 {
                info!(dropped, "stopped downloads of the previous generation");
            }
        }
        Ok(switched)
    }
}
