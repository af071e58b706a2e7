//! Network side of the cache: the CMS / content origin.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Method, StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use tracing::debug;
use url::Url;

use crate::{
    error::{CacheError, Result},
    range::{ByteRange, ByteRangeSpec, parse_content_range},
    response::CacheResponse,
};

/// A request to the origin.
#[derive(Debug, Clone)]
pub struct OriginRequest {
    pub method: Method,
    pub url: Url,
    pub range: Option<ByteRangeSpec>,
    /// Extra headers relayed from the renderer on bypassed requests.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl OriginRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            range: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_range(mut self, range: ByteRangeSpec) -> Self {
        self.range = Some(range);
        self
    }
}

/// A buffered origin response. Non-2xx statuses are responses, not errors.
#[derive(Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl fmt::Debug for OriginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OriginResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl OriginResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn content_range(&self) -> Option<(ByteRange, Option<u64>)> {
        self.headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range)
    }
}

/// Headers worth relaying from the origin to the renderer.
const RELAYED_HEADERS: &[header::HeaderName] = &[
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::CACHE_CONTROL,
    header::ETAG,
    header::LAST_MODIFIED,
];

impl From<OriginResponse> for CacheResponse {
    fn from(origin: OriginResponse) -> Self {
        let mut response = CacheResponse::relayed(origin.status, origin.body);
        for name in RELAYED_HEADERS {
            if let Some(value) = origin.headers.get(name) {
                response.headers.insert(name.clone(), value.clone());
            }
        }
        response
    }
}

/// Anything that can answer origin requests. The production implementation
/// is [`HttpOrigin`]; tests substitute an in-memory origin.
#[async_trait]
pub trait Origin: Send + Sync + fmt::Debug {
    /// Perform `request`. Transport failures are `Err(CacheError::Origin)`.
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse>;
}

/// Origin reached over HTTP(S) with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpOrigin {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("marquee/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, request: OriginRequest) -> Result<OriginResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        builder = builder.headers(request.headers.clone());
        if let Some(range) = request.range
            && let Ok(value) = HeaderValue::from_str(&range.to_string())
        {
            builder = builder.header(header::RANGE, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(
            method = %request.method,
            url = %request.url,
            status = status.as_u16(),
            bytes = body.len(),
            "origin responded"
        );

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }
}

/// Resolve a request target (`/path?query`) against the origin base URL.
pub fn origin_url(base: &Url, path: &str, query: Option<&str>) -> Result<Url> {
    let mut url = base
        .join(path.trim_start_matches('/'))
        .map_err(|e| CacheError::Internal(format!("bad origin path {path}: {e}")))?;
    url.set_query(query.filter(|q| !q.is_empty()));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_url_keeps_base_path_prefix() {
        let base = Url::parse("https://cms.example.com/player/").unwrap();
        let url = origin_url(&base, "/xmds.php", Some("file=42.mp4")).unwrap();
        assert_eq!(
            url.as_str(),
            "https://cms.example.com/player/xmds.php?file=42.mp4"
        );
    }

    #[test]
    fn empty_query_is_dropped() {
        let base = Url::parse("https://cms.example.com/").unwrap();
        let url = origin_url(&base, "/layout.xml", Some("")).unwrap();
        assert_eq!(url.as_str(), "https://cms.example.com/layout.xml");
    }
}
