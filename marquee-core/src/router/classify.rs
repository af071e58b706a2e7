//! Pure classification of intercepted requests by URL shape.
//!
//! Each URL shape the renderer uses is a [`RouteMatcher`]. The
//! [`Classifier`] asks them in order and falls back to
//! [`Classification::Passthrough`]. Nothing here looks at cache state, so
//! the same request always routes the same way.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Method;

use crate::{
    cache::{CacheKey, KeyKind},
    media_type::extension_of,
    range::ByteRangeSpec,
};

/// Default path of the legacy media-delivery endpoint.
pub const DEFAULT_LEGACY_ENDPOINT: &str = "xmds.php";

/// Values of the resource-class query parameter that mark immutable,
/// per-filename assets (bundles, fonts, scripts).
pub const RESOURCE_CLASSES: &[&str] =
    &["bundle", "fontCss", "font", "asset", "resource", "dependency"];

const FILE_PARAM: &str = "file";
const FILE_TYPE_PARAM: &str = "fileType";

static CACHE_NAMESPACE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/cache/(media|layout|resource)/([^/]+)$")
        .expect("cache namespace regex should compile")
});
static WIDGET_HTML_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^/cache/widget/([^/.]+)(?:\.html?)?$")
        .expect("widget html regex should compile")
});

/// How a request will be fulfilled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// `/cache/<kind>/<id>`: the remainder is the cache key.
    CachePrefixed {
        key: CacheKey,
        extension: Option<String>,
    },
    /// Legacy `xmds.php?file=42.mp4` delivery.
    LegacyMediaQuery { key: CacheKey, file_name: String },
    /// `/cache/widget/<id>`: rendered widget markup.
    WidgetHtmlPath { key: CacheKey },
    /// Signed resource URL; cached by file name alone.
    WidgetResourceQuery { key: CacheKey, file_name: String },
    /// Anything else: exact-URL cache, then network.
    Passthrough,
}

impl Classification {
    pub fn name(&self) -> &'static str {
        match self {
            Classification::CachePrefixed { .. } => "cache_prefixed",
            Classification::LegacyMediaQuery { .. } => "legacy_media_query",
            Classification::WidgetHtmlPath { .. } => "widget_html_path",
            Classification::WidgetResourceQuery { .. } => "widget_resource_query",
            Classification::Passthrough => "passthrough",
        }
    }

    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Classification::CachePrefixed { key, .. }
            | Classification::LegacyMediaQuery { key, .. }
            | Classification::WidgetHtmlPath { key }
            | Classification::WidgetResourceQuery { key, .. } => Some(key),
            Classification::Passthrough => None,
        }
    }
}

/// The parts of a request a matcher may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestParts<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: &'a [(String, String)],
}

impl RequestParts<'_> {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// One URL shape: a predicate and key extractor in one.
pub trait RouteMatcher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `Some` when this matcher owns the request. Returning
    /// `Some(Passthrough)` claims the request and stops later matchers.
    fn classify(&self, request: &RequestParts<'_>) -> Option<Classification>;
}

#[derive(Debug, Default)]
pub struct CacheNamespaceMatcher;

impl RouteMatcher for CacheNamespaceMatcher {
    fn name(&self) -> &'static str {
        "cache_namespace"
    }

    fn classify(&self, request: &RequestParts<'_>) -> Option<Classification> {
        let captures = CACHE_NAMESPACE_PATTERN.captures(request.path)?;
        let kind = KeyKind::parse(&captures[1])?;
        let name = &captures[2];
        let extension = extension_of(name);

        // Resources are keyed by full file name, everything else by id.
        let id = match kind {
            KeyKind::Resource => name,
            _ => leading_segment(name)?,
        };
        Some(Classification::CachePrefixed {
            key: CacheKey::new(kind, id),
            extension,
        })
    }
}

/// `.../xmds.php?file=42.mp4[&fileType=media]`.
#[derive(Debug)]
pub struct LegacyMediaMatcher {
    endpoint: String,
}

impl LegacyMediaMatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_start_matches('/').to_string(),
        }
    }
}

impl Default for LegacyMediaMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_LEGACY_ENDPOINT)
    }
}

impl RouteMatcher for LegacyMediaMatcher {
    fn name(&self) -> &'static str {
        "legacy_media"
    }

    fn classify(&self, request: &RequestParts<'_>) -> Option<Classification> {
        let on_endpoint = request
            .path
            .rsplit('/')
            .next()
            .is_some_and(|last| last == self.endpoint);
        if !on_endpoint {
            return None;
        }
        let file = request.param(FILE_PARAM).filter(|f| !f.is_empty())?;
        let kind = match request.param(FILE_TYPE_PARAM) {
            None | Some("media") => KeyKind::Media,
            Some("layout") => KeyKind::Layout,
            Some(_) => return None,
        };

        // Size probes must see the origin's real content length.
        if *request.method == Method::HEAD {
            return Some(Classification::Passthrough);
        }

        let file_name = base_name(file);
        Some(Classification::LegacyMediaQuery {
            key: CacheKey::new(kind, leading_segment(file_name)?),
            file_name: file_name.to_string(),
        })
    }
}

#[derive(Debug, Default)]
pub struct WidgetHtmlMatcher;

impl RouteMatcher for WidgetHtmlMatcher {
    fn name(&self) -> &'static str {
        "widget_html"
    }

    fn classify(&self, request: &RequestParts<'_>) -> Option<Classification> {
        let captures = WIDGET_HTML_PATTERN.captures(request.path)?;
        Some(Classification::WidgetHtmlPath {
            key: CacheKey::widget(&captures[1]),
        })
    }
}

/// `...?file=bundle.min.js&fileType=bundle&X-Amz-Signature=...`: the
/// signature churns, the file does not.
#[derive(Debug, Default)]
pub struct WidgetResourceMatcher;

impl RouteMatcher for WidgetResourceMatcher {
    fn name(&self) -> &'static str {
        "widget_resource"
    }

    fn classify(&self, request: &RequestParts<'_>) -> Option<Classification> {
        let class = request.param(FILE_TYPE_PARAM)?;
        if !RESOURCE_CLASSES.contains(&class) {
            return None;
        }
        let file_name = base_name(request.param(FILE_PARAM)?);
        if file_name.is_empty() {
            return None;
        }
        Some(Classification::WidgetResourceQuery {
            key: CacheKey::resource(file_name),
            file_name: file_name.to_string(),
        })
    }
}

/// A classified request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub method: Method,
    pub raw_path: String,
    pub raw_query: Option<String>,
    pub query_params: Vec<(String, String)>,
    pub classification: Classification,
    /// Parsed `Range` header; malformed headers are ignored.
    pub range: Option<ByteRangeSpec>,
}

impl RequestDescriptor {
    /// `path?query` as received, used for exact-URL cache keys.
    pub fn target(&self) -> String {
        match self.raw_query.as_deref().filter(|q| !q.is_empty()) {
            Some(query) => format!("{}?{}", self.raw_path, query),
            None => self.raw_path.clone(),
        }
    }
}

/// Ordered list of matchers with a passthrough fallback.
#[derive(Debug)]
pub struct Classifier {
    matchers: Vec<Box<dyn RouteMatcher>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_LEGACY_ENDPOINT)
    }
}

impl Classifier {
    /// The standard matcher order: cache namespace, legacy media query,
    /// widget markup path, signed widget resource.
    pub fn new(legacy_endpoint: &str) -> Self {
        Self {
            matchers: vec![
                Box::new(CacheNamespaceMatcher),
                Box::new(LegacyMediaMatcher::new(legacy_endpoint)),
                Box::new(WidgetHtmlMatcher),
                Box::new(WidgetResourceMatcher),
            ],
        }
    }

    /// Append a matcher after the existing ones.
    pub fn with_matcher(mut self, matcher: impl RouteMatcher + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }

    pub fn matcher_names(&self) -> Vec<&'static str> {
        self.matchers.iter().map(|m| m.name()).collect()
    }

    pub fn classify(&self, request: &RequestParts<'_>) -> Classification {
        self.matchers
            .iter()
            .find_map(|m| m.classify(request))
            .unwrap_or(Classification::Passthrough)
    }

    pub fn describe(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        range_header: Option<&str>,
    ) -> RequestDescriptor {
        let query_params: Vec<(String, String)> = query
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        let classification = self.classify(&RequestParts {
            method,
            path,
            query: &query_params,
        });
        let range = range_header.and_then(|h| ByteRangeSpec::parse(h).ok());

        RequestDescriptor {
            method: method.clone(),
            raw_path: path.to_string(),
            raw_query: query.map(str::to_string),
            query_params,
            classification,
            range,
        }
    }
}

/// `"42.mp4"` to `"42"`.
fn leading_segment(file_name: &str) -> Option<&str> {
    let segment = file_name.split('.').next()?;
    (!segment.is_empty()).then_some(segment)
}

fn base_name(file: &str) -> &str {
    file.rsplit('/').next().unwrap_or(file)
}
