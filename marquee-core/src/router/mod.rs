//! Request interception: classify, then serve from cache or fetch.
//!
//! [`RequestRouter::intercept`] is the single entry point used by the HTTP
//! layer. Every outcome is a concrete response; origin failures become
//! 202 (media still downloading) or 404 (this one request), never errors.

pub mod classify;

pub use classify::*;

use std::{sync::Arc, time::Duration};

use reqwest::{Method, StatusCode, header::HeaderMap};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cache::{BlobRecord, BlobStore, CacheKey, CacheManager},
    error::{CacheError, Result},
    fetcher::{ChunkFetcher, FetchTarget},
    media_type::{content_type_for, extension_of, is_streaming_media},
    origin::{Origin, OriginRequest, origin_url},
    range::{ByteRangeSpec, RangeEmulator, Slice},
    required::RequiredFiles,
    response::{CacheResponse, CacheStatus},
};

/// Knobs the router needs from configuration.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Base URL that relative request targets resolve against.
    pub origin_base: Url,
    /// Advertised in `Retry-After` while media is downloading.
    pub retry_after: Duration,
}

/// An intercepted renderer request.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Raw `Range` header, if any.
    pub range: Option<String>,
}

impl InterceptRequest {
    pub fn get(path: impl Into<String>, query: Option<&str>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: query.map(str::to_string),
            range: None,
        }
    }

    pub fn with_range(mut self, range: impl Into<String>) -> Self {
        self.range = Some(range.into());
        self
    }
}

/// What the HTTP layer should do with an intercepted request.
#[derive(Debug)]
pub enum Interception {
    Respond(CacheResponse),
    /// Not ours; relay to the origin untouched (see [`RequestRouter::forward`]).
    Bypass(RequestDescriptor),
}

/// How to fill a keyed miss.
#[derive(Debug)]
struct KeyPlan {
    source: Option<FetchTarget>,
    streaming_media: bool,
}

pub struct RequestRouter {
    cache: Arc<CacheManager>,
    required: Arc<RequiredFiles>,
    origin: Arc<dyn Origin>,
    fetcher: ChunkFetcher,
    classifier: Classifier,
    emulator: RangeEmulator,
    settings: RouterSettings,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("classifier", &self.classifier)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RequestRouter {
    pub fn new(
        cache: Arc<CacheManager>,
        required: Arc<RequiredFiles>,
        origin: Arc<dyn Origin>,
        fetcher: ChunkFetcher,
        classifier: Classifier,
        settings: RouterSettings,
    ) -> Self {
        Self {
            cache,
            required,
            origin,
            fetcher,
            classifier,
            emulator: RangeEmulator,
            settings,
        }
    }

    pub fn fetcher(&self) -> &ChunkFetcher {
        &self.fetcher
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub async fn intercept(&self, request: &InterceptRequest) -> Interception {
        let descriptor = self.classifier.describe(
            &request.method,
            &request.path,
            request.query.as_deref(),
            request.range.as_deref(),
        );
        debug!(
            method = %descriptor.method,
            path = %descriptor.raw_path,
            classification = descriptor.classification.name(),
            range = ?descriptor.range,
            "intercepted request"
        );

        let is_head = descriptor.method == Method::HEAD;
        let passthrough = descriptor.classification == Classification::Passthrough;
        if (descriptor.method != Method::GET && !is_head) || (is_head && passthrough) {
            return Interception::Bypass(descriptor);
        }

        let response = match &descriptor.classification {
            Classification::Passthrough => self.serve_passthrough(&descriptor).await,
            Classification::CachePrefixed { key, extension } => {
                let plan = self.registered_plan(key, extension.as_deref());
                self.serve_key(key, plan, descriptor.range).await
            }
            Classification::WidgetHtmlPath { key } => {
                let plan = self.registered_plan(key, Some("html"));
                self.serve_key(key, plan, descriptor.range)
                    .await
                    .with_content_type(content_type_for("html"))
            }
            Classification::LegacyMediaQuery { key, file_name }
            | Classification::WidgetResourceQuery { key, file_name } => {
                let plan = self.request_plan(key, file_name, &descriptor);
                self.serve_key(key, plan, descriptor.range).await
            }
        };

        Interception::Respond(if is_head {
            response.without_body()
        } else {
            response
        })
    }

    /// Relay a bypassed request to the origin without caching it.
    pub async fn forward(
        &self,
        descriptor: &RequestDescriptor,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> CacheResponse {
        let url = match origin_url(
            &self.settings.origin_base,
            &descriptor.raw_path,
            descriptor.raw_query.as_deref(),
        ) {
            Ok(url) => url,
            Err(err) => {
                warn!(path = %descriptor.raw_path, error = %err, "cannot build origin url");
                return CacheResponse::not_found("unroutable request");
            }
        };

        let mut request = OriginRequest::new(descriptor.method.clone(), url);
        request.headers = headers;
        request.body = body;
        match self.origin.fetch(request).await {
            Ok(response) => response.into(),
            Err(err) => {
                warn!(path = %descriptor.raw_path, error = %err, "origin unreachable for bypassed request");
                CacheResponse::not_found("origin unreachable")
            }
        }
    }

    /// Source from the sync-announced descriptor for this key, if any.
    fn registered_plan(&self, key: &CacheKey, extension: Option<&str>) -> KeyPlan {
        let descriptor = self.required.get(key);
        let streaming_media = extension.is_some_and(is_streaming_media)
            || descriptor.as_ref().is_some_and(|d| d.is_streaming_media());
        KeyPlan {
            source: descriptor.map(|d| FetchTarget {
                key: key.clone(),
                content_type: match extension {
                    Some("html") => content_type_for("html").to_string(),
                    _ => d.resolved_content_type(),
                },
                url: d.url,
            }),
            streaming_media,
        }
    }

    /// Source is the intercepted URL itself, signatures and all.
    fn request_plan(
        &self,
        key: &CacheKey,
        file_name: &str,
        descriptor: &RequestDescriptor,
    ) -> KeyPlan {
        let extension = extension_of(file_name);
        let source = match origin_url(
            &self.settings.origin_base,
            &descriptor.raw_path,
            descriptor.raw_query.as_deref(),
        ) {
            Ok(url) => Some(FetchTarget {
                key: key.clone(),
                url,
                content_type: content_type_for(extension.as_deref().unwrap_or(""))
                    .to_string(),
            }),
            Err(err) => {
                warn!(key = %key, error = %err, "cannot build origin url");
                None
            }
        };
        let streaming_media = matches!(
            descriptor.classification,
            Classification::LegacyMediaQuery { .. }
        ) && extension.as_deref().is_some_and(is_streaming_media);

        KeyPlan {
            source,
            streaming_media,
        }
    }

    async fn serve_key(
        &self,
        key: &CacheKey,
        plan: KeyPlan,
        range: Option<ByteRangeSpec>,
    ) -> CacheResponse {
        let store = self.cache.store().await;
        let record = lookup(&store, key).await;

        if let Some(record) = &record {
            if record.is_complete() {
                match self.serve_complete(&store, record, range).await {
                    Ok(response) => return response,
                    Err(err) => {
                        warn!(key = %key, error = %err, "cached blob unreadable, treating as a miss");
                    }
                }
            } else if let Some(spec) = range {
                match self.emulator.slice(&store, record, spec).await {
                    Ok(Slice::Hit(response)) | Ok(Slice::Unsatisfiable(response)) => {
                        return response;
                    }
                    Ok(Slice::Uncovered(spec)) => {
                        if let Some(target) = &plan.source {
                            return self
                                .fetch_uncovered(&store, target, spec, record, plan.streaming_media)
                                .await;
                        }
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "partial blob unreadable");
                    }
                }
            }
        }

        let Some(target) = plan.source else {
            debug!(key = %key, "no cached copy and no known source");
            // Media may still arrive through sync; the element should retry.
            return if plan.streaming_media {
                CacheResponse::accepted(self.settings.retry_after)
            } else {
                CacheResponse::not_found("not cached")
            };
        };

        if plan.streaming_media {
            if self.fetcher.spawn_download(store, target) {
                info!(key = %key, "media not cached yet, download started");
            }
            return CacheResponse::accepted(self.settings.retry_after);
        }

        self.fetch_whole(&store, &target, range).await
    }

    async fn serve_complete(
        &self,
        store: &BlobStore,
        record: &BlobRecord,
        range: Option<ByteRangeSpec>,
    ) -> Result<CacheResponse> {
        let Some(spec) = range else {
            let body = store.read_all(record).await?;
            return Ok(CacheResponse::full(&record.content_type, body));
        };
        match self.emulator.slice(store, record, spec).await? {
            Slice::Hit(response) | Slice::Unsatisfiable(response) => Ok(response),
            Slice::Uncovered(_) => Err(CacheError::Integrity(format!(
                "{} is marked complete but has gaps",
                record.key
            ))),
        }
    }

    async fn fetch_uncovered(
        &self,
        store: &BlobStore,
        target: &FetchTarget,
        spec: ByteRangeSpec,
        record: &BlobRecord,
        streaming_media: bool,
    ) -> CacheResponse {
        match self.fetcher.fetch_range(store, target, spec).await {
            Ok(fetched) => fetched.into_response(),
            Err(CacheError::InvalidRange(reason)) => {
                debug!(key = %target.key, %reason, "origin rejected range");
                CacheResponse::range_not_satisfiable(record.size_bytes)
            }
            Err(err) if streaming_media && err.is_transient() => {
                warn!(key = %target.key, error = %err, "range fetch failed, waiting on download");
                self.fetcher.spawn_download(store.clone(), target.clone());
                CacheResponse::accepted(self.settings.retry_after)
            }
            Err(err) => {
                warn!(key = %target.key, error = %err, "range fetch failed");
                CacheResponse::not_found("range not available")
            }
        }
    }

    /// Synchronous whole-file fetch for small, non-streaming blobs.
    async fn fetch_whole(
        &self,
        store: &BlobStore,
        target: &FetchTarget,
        range: Option<ByteRangeSpec>,
    ) -> CacheResponse {
        let response = match self.origin.fetch(OriginRequest::get(target.url.clone())).await {
            Ok(response) => response,
            Err(err) => {
                warn!(key = %target.key, error = %err, "origin unreachable");
                return CacheResponse::not_found("origin unreachable");
            }
        };
        if response.status != StatusCode::OK {
            debug!(key = %target.key, status = response.status.as_u16(), "origin had no copy");
            return CacheResponse::not_found("origin had no copy");
        }

        let content_type = response
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| target.content_type.clone());
        if let Err(err) = store
            .put_complete(&target.key, &content_type, &response.body)
            .await
        {
            warn!(key = %target.key, error = %err, "failed to persist fetched blob");
        }

        respond_with(&content_type, response.body, range)
            .with_cache_status(CacheStatus::Fetched)
    }

    /// Exact-URL cache first, then the origin. Only plain 200 GETs are kept.
    async fn serve_passthrough(&self, descriptor: &RequestDescriptor) -> CacheResponse {
        let key = CacheKey::url(descriptor.target());
        let store = self.cache.store().await;

        if let Some(record) = lookup(&store, &key).await
            && record.is_complete()
        {
            match self.serve_complete(&store, &record, descriptor.range).await {
                Ok(response) => return response,
                Err(err) => {
                    warn!(key = %key, error = %err, "cached url unreadable, refetching");
                }
            }
        }

        let url = match origin_url(
            &self.settings.origin_base,
            &descriptor.raw_path,
            descriptor.raw_query.as_deref(),
        ) {
            Ok(url) => url,
            Err(err) => {
                warn!(key = %key, error = %err, "cannot build origin url");
                return CacheResponse::not_found("unroutable request");
            }
        };
        let mut request = OriginRequest::get(url);
        if let Some(range) = descriptor.range {
            request = request.with_range(range);
        }

        match self.origin.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK && descriptor.range.is_none() {
                    let content_type = response
                        .content_type()
                        .unwrap_or_else(|| content_type_for(""))
                        .to_string();
                    if let Err(err) = store
                        .put_complete(&key, &content_type, &response.body)
                        .await
                    {
                        warn!(key = %key, error = %err, "failed to persist passthrough body");
                    }
                }
                response.into()
            }
            Err(err) => {
                warn!(key = %key, error = %err, "origin unreachable");
                CacheResponse::not_found("origin unreachable")
            }
        }
    }
}

/// Read the manifest, logging and swallowing store errors.
async fn lookup(store: &BlobStore, key: &CacheKey) -> Option<BlobRecord> {
    match store.record(key).await {
        Ok(record) => record,
        Err(err) => {
            warn!(key = %key, error = %err, "manifest unreadable");
            None
        }
    }
}

/// Shape freshly fetched bytes for the request that asked for them.
fn respond_with(
    content_type: &str,
    body: Vec<u8>,
    range: Option<ByteRangeSpec>,
) -> CacheResponse {
    let Some(spec) = range else {
        return CacheResponse::full(content_type, body);
    };
    let total = body.len() as u64;
    match spec.resolve(total) {
        Ok(range) => {
            let slice = body[range.start as usize..=range.end as usize].to_vec();
            CacheResponse::partial(content_type, range, total, slice)
        }
        Err(_) => CacheResponse::range_not_satisfiable(total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bytes_are_sliced_for_range_requests() {
        let body = (0u8..100).collect::<Vec<_>>();
        let response = respond_with(
            "text/css",
            body,
            Some(ByteRangeSpec::From {
                start: 10,
                end: Some(19),
            }),
        );
        assert_eq!(response.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.body, (10u8..20).collect::<Vec<_>>());
    }

    #[test]
    fn fresh_bytes_reject_ranges_past_the_end() {
        let response = respond_with(
            "text/css",
            vec![0; 10],
            Some(ByteRangeSpec::From {
                start: 50,
                end: None,
            }),
        );
        assert_eq!(response.status, StatusCode::RANGE_NOT_SATISFIABLE);
    }
}
