//! Required-files registry fed by the collection/sync process.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    cache::{CacheKey, KeyKind},
    media_type::{content_type_for, extension_of, is_streaming_media},
};

/// One file the player needs, as announced by the sync process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub key: CacheKey,
    /// Absolute origin URL the bytes can be downloaded from.
    pub url: Url,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Original file name, used for extension-based typing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl FileDescriptor {
    pub fn extension(&self) -> Option<String> {
        self.file_name
            .as_deref()
            .and_then(extension_of)
            .or_else(|| extension_of(self.url.path()))
    }

    pub fn resolved_content_type(&self) -> String {
        if let Some(content_type) = &self.content_type {
            return content_type.clone();
        }
        if self.key.kind() == KeyKind::Widget {
            return content_type_for("html").to_string();
        }
        self.extension()
            .map(|ext| content_type_for(&ext).to_string())
            .unwrap_or_else(|| content_type_for("").to_string())
    }

    pub fn is_streaming_media(&self) -> bool {
        if let Some(content_type) = &self.content_type {
            return content_type.starts_with("video/")
                || content_type.starts_with("audio/");
        }
        self.extension().is_some_and(|ext| is_streaming_media(&ext))
    }
}

/// Keys the sync process has announced, with their origin locations.
#[derive(Debug, Default)]
pub struct RequiredFiles {
    entries: DashMap<CacheKey, FileDescriptor>,
}

impl RequiredFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `descriptors`, replacing earlier announcements for the same
    /// keys. Returns how many keys were not known before.
    pub fn register<I>(&self, descriptors: I) -> usize
    where
        I: IntoIterator<Item = FileDescriptor>,
    {
        descriptors
            .into_iter()
            .filter(|d| self.entries.insert(d.key.clone(), d.clone()).is_none())
            .count()
    }

    pub fn get(&self, key: &CacheKey) -> Option<FileDescriptor> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every announcement, e.g. after a cache generation rollover.
    pub fn clear(&self) {
        self.entries.clear();
    }
}
