use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// The namespaces a cached blob can live under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Media,
    Layout,
    Widget,
    Resource,
    /// Exact-URL entries written by the passthrough route.
    Url,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Media => "media",
            KeyKind::Layout => "layout",
            KeyKind::Widget => "widget",
            KeyKind::Resource => "resource",
            KeyKind::Url => "url",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "media" => Some(KeyKind::Media),
            "layout" => Some(KeyKind::Layout),
            "widget" => Some(KeyKind::Widget),
            "resource" => Some(KeyKind::Resource),
            "url" => Some(KeyKind::Url),
            _ => None,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable key for locating a blob within the cache.
///
/// The textual form (`media/42`, `widget/7`, `resource/bundle.min.js`) is a
/// public contract: the renderer addresses blobs as `cache/<kind>/<id>`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    kind: KeyKind,
    id: String,
}

impl CacheKey {
    pub fn new(kind: KeyKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn media(id: impl Into<String>) -> Self {
        Self::new(KeyKind::Media, id)
    }

    pub fn layout(id: impl Into<String>) -> Self {
        Self::new(KeyKind::Layout, id)
    }

    pub fn widget(id: impl Into<String>) -> Self {
        Self::new(KeyKind::Widget, id)
    }

    pub fn resource(file_name: impl Into<String>) -> Self {
        Self::new(KeyKind::Resource, file_name)
    }

    /// Key for an exact request target (`path` plus optional `?query`).
    pub fn url(target: impl Into<String>) -> Self {
        Self::new(KeyKind::Url, target)
    }

    /// Parse `kind/id`. The id may itself contain slashes (url keys do).
    pub fn parse(value: &str) -> Option<Self> {
        let (kind, id) = value.split_once('/')?;
        let kind = KeyKind::parse(kind)?;
        if id.is_empty() {
            return None;
        }
        Some(Self::new(kind, id))
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Index key of the manifest entry describing this blob.
    pub(crate) fn manifest_key(&self) -> String {
        format!("manifest/v1/{}/{}", self.kind, self.id)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.to_string()).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CacheKey::parse(&value).ok_or_else(|| {
            CacheError::Internal(format!("invalid cache key: {value}"))
        })
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_round_trips_through_text() {
        let key = CacheKey::media("42");
        assert_eq!(key.to_string(), "media/42");
        assert_eq!(CacheKey::parse("media/42"), Some(key));
    }

    #[test]
    fn url_keys_keep_embedded_slashes() {
        let key = CacheKey::parse("url/assets/app.js?v=3").unwrap();
        assert_eq!(key.kind(), KeyKind::Url);
        assert_eq!(key.id(), "assets/app.js?v=3");
    }

    #[test]
    fn unknown_kinds_and_empty_ids_are_rejected() {
        assert!(CacheKey::parse("video/42").is_none());
        assert!(CacheKey::parse("media/").is_none());
        assert!(CacheKey::parse("media").is_none());
    }

    #[test]
    fn manifest_key_is_versioned() {
        assert_eq!(
            CacheKey::widget("7").manifest_key(),
            "manifest/v1/widget/7"
        );
    }
}
