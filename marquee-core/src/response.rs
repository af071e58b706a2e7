use std::{fmt, time::Duration};

use reqwest::{
    StatusCode,
    header::{self, HeaderMap, HeaderName, HeaderValue},
};

use crate::range::ByteRange;

/// Diagnostic header describing how a response was produced.
pub const CACHE_STATUS_HEADER: &str = "x-marquee-cache";

/// How the router produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served entirely from persisted bytes.
    Hit,
    /// Fetched from the origin on demand (and persisted where possible).
    Fetched,
    /// Still downloading; the caller should retry shortly.
    Pending,
    /// Nothing cached and nothing reachable.
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Fetched => "fetched",
            CacheStatus::Pending => "pending",
            CacheStatus::Miss => "miss",
        }
    }
}

/// A fully materialized response for the renderer.
#[derive(Clone)]
pub struct CacheResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub cache_status: CacheStatus,
}

impl fmt::Debug for CacheResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("cache_status", &self.cache_status)
            .finish()
    }
}

impl CacheResponse {
    fn new(status: StatusCode, cache_status: CacheStatus) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static(cache_status.as_str()),
        );
        Self {
            status,
            headers,
            body: Vec::new(),
            cache_status,
        }
    }

    /// 200 with the whole payload.
    pub fn full(content_type: &str, body: Vec<u8>) -> Self {
        let mut response = Self::new(StatusCode::OK, CacheStatus::Hit);
        response.set_content_type(content_type);
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        response
            .headers
            .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        response.body = body;
        response
    }

    /// 206 for `range` of a `total`-byte blob.
    pub fn partial(
        content_type: &str,
        range: ByteRange,
        total: u64,
        body: Vec<u8>,
    ) -> Self {
        let mut response =
            Self::new(StatusCode::PARTIAL_CONTENT, CacheStatus::Hit);
        response.set_content_type(content_type);
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        response.insert_str(header::CONTENT_RANGE, &range.content_range(total));
        response
            .headers
            .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        response.body = body;
        response
    }

    /// Response relayed from the origin; the caller copies headers.
    pub(crate) fn relayed(status: StatusCode, body: Vec<u8>) -> Self {
        let mut response = Self::new(status, CacheStatus::Fetched);
        response.body = body;
        response
    }

    /// 202: the blob is being downloaded, retry after `retry_after`.
    pub fn accepted(retry_after: Duration) -> Self {
        let mut response = Self::new(StatusCode::ACCEPTED, CacheStatus::Pending);
        response.headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after.as_secs().max(1)),
        );
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
        response
    }

    /// 404 for this one request.
    pub fn not_found(reason: &str) -> Self {
        let mut response = Self::new(StatusCode::NOT_FOUND, CacheStatus::Miss);
        response.set_content_type("text/plain; charset=utf-8");
        response.body = reason.as_bytes().to_vec();
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(response.body.len()));
        response
    }

    /// 416 with `content-range: bytes */TOTAL`.
    pub fn range_not_satisfiable(total: u64) -> Self {
        let mut response =
            Self::new(StatusCode::RANGE_NOT_SATISFIABLE, CacheStatus::Miss);
        response.insert_str(header::CONTENT_RANGE, &format!("bytes */{total}"));
        response
            .headers
            .insert(header::CONTENT_LENGTH, HeaderValue::from(0u64));
        response
    }

    /// Re-tag how this response was produced.
    pub fn with_cache_status(mut self, cache_status: CacheStatus) -> Self {
        self.cache_status = cache_status;
        self.headers.insert(
            HeaderName::from_static(CACHE_STATUS_HEADER),
            HeaderValue::from_static(cache_status.as_str()),
        );
        self
    }

    /// Override the declared content type of a payload response. Responses
    /// without a payload (202, 404, 416) are left as they are.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        if matches!(self.status, StatusCode::OK | StatusCode::PARTIAL_CONTENT) {
            self.set_content_type(content_type);
        }
        self
    }

    /// Drop the body, keeping headers (for HEAD).
    pub fn without_body(mut self) -> Self {
        self.body = Vec::new();
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    fn set_content_type(&mut self, content_type: &str) {
        let value = HeaderValue::from_str(content_type).unwrap_or_else(|_| {
            HeaderValue::from_static("application/octet-stream")
        });
        self.headers.insert(header::CONTENT_TYPE, value);
    }

    fn insert_str(&mut self, name: HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }
}
