//! Bounded retry with cache and placeholder fallback for widget markup.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    cache::{CacheKey, CacheManager},
    error::{CacheError, Result},
    media_type::content_type_for,
    origin::{Origin, OriginRequest, origin_url},
};

pub const MAX_ATTEMPTS: u16 = 3;
pub const BACKOFF_BASE_MS: u64 = 2_000;

/// Shown when neither the origin nor the cache has markup. Blank, not an
/// error message.
pub const DEFAULT_PLACEHOLDER: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><style>html,body{margin:0;background:transparent}</style></head><body></body></html>";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Linear backoff: wait `attempt * base` after a failed `attempt`.
    pub fn delay_after(&self, attempt: u16) -> Duration {
        self.backoff_base() * u32::from(attempt)
    }

    /// Upper bound on time spent sleeping before a terminal state.
    pub fn worst_case_delay(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|attempt| self.delay_after(attempt))
            .sum()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_base_ms: BACKOFF_BASE_MS,
        }
    }
}

/// Where fresh widget markup comes from.
#[async_trait]
pub trait MarkupSource: Send + Sync + fmt::Debug {
    async fn fetch_markup(&self, widget_id: &str) -> Result<String>;
}

/// Renders widgets by asking the origin at `path_template` with `{id}`
/// replaced by the widget id.
#[derive(Debug, Clone)]
pub struct OriginMarkupSource {
    origin: Arc<dyn Origin>,
    base: Url,
    path_template: String,
}

impl OriginMarkupSource {
    pub fn new(origin: Arc<dyn Origin>, base: Url, path_template: impl Into<String>) -> Self {
        Self {
            origin,
            base,
            path_template: path_template.into(),
        }
    }

    fn url_for(&self, widget_id: &str) -> Result<Url> {
        let target = self.path_template.replace("{id}", widget_id);
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target.as_str(), None),
        };
        origin_url(&self.base, path, query)
    }
}

#[async_trait]
impl MarkupSource for OriginMarkupSource {
    async fn fetch_markup(&self, widget_id: &str) -> Result<String> {
        let url = self.url_for(widget_id)?;
        let response = self.origin.fetch(OriginRequest::get(url.clone())).await?;
        if response.status != StatusCode::OK {
            return Err(CacheError::Origin(format!(
                "{url} answered {}",
                response.status
            )));
        }
        String::from_utf8(response.body)
            .map_err(|e| CacheError::Origin(format!("{url} sent non-utf8 markup: {e}")))
    }
}

/// Per-call progress of [`WidgetMarkupService::fetch_widget_markup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState {
    Attempting { attempt: u16 },
    RetriesExhausted,
    Succeeded(String),
    UsingStaleCache(String),
    UsingPlaceholder,
}

/// Markup handed to the renderer, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkupOutcome {
    Fresh(String),
    Stale(String),
    Placeholder(String),
}

impl MarkupOutcome {
    pub fn source(&self) -> &'static str {
        match self {
            MarkupOutcome::Fresh(_) => "fresh",
            MarkupOutcome::Stale(_) => "stale",
            MarkupOutcome::Placeholder(_) => "placeholder",
        }
    }

    pub fn markup(&self) -> &str {
        match self {
            MarkupOutcome::Fresh(markup)
            | MarkupOutcome::Stale(markup)
            | MarkupOutcome::Placeholder(markup) => markup,
        }
    }

    pub fn into_markup(self) -> String {
        match self {
            MarkupOutcome::Fresh(markup)
            | MarkupOutcome::Stale(markup)
            | MarkupOutcome::Placeholder(markup) => markup,
        }
    }
}

/// Fetches widget markup so that the caller always gets something to show.
pub struct WidgetMarkupService {
    source: Arc<dyn MarkupSource>,
    cache: Arc<CacheManager>,
    policy: RetryPolicy,
    placeholder: String,
}

impl fmt::Debug for WidgetMarkupService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WidgetMarkupService")
            .field("source", &self.source)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl WidgetMarkupService {
    pub fn new(
        source: Arc<dyn MarkupSource>,
        cache: Arc<CacheManager>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            cache,
            policy,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
        }
    }

    /// Replace the placeholder; blank markup keeps the default.
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        let placeholder = placeholder.into();
        if !placeholder.trim().is_empty() {
            self.placeholder = placeholder;
        }
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Fresh markup if the source answers within the retry budget, else the
    /// last cached copy, else the placeholder. Never fails.
    pub async fn fetch_widget_markup(&self, widget_id: &str) -> MarkupOutcome {
        let key = CacheKey::widget(widget_id);
        let max_attempts = self.policy.max_attempts.max(1);
        let mut state = RetryState::Attempting { attempt: 1 };

        loop {
            state = match state {
                RetryState::Attempting { attempt } => {
                    match self.source.fetch_markup(widget_id).await {
                        Ok(markup) if !markup.trim().is_empty() => {
                            RetryState::Succeeded(markup)
                        }
                        result => {
                            let reason = match result {
                                Err(err) => err.to_string(),
                                Ok(_) => "empty markup".to_string(),
                            };
                            if attempt < max_attempts {
                                let delay = self.policy.delay_after(attempt);
                                debug!(
                                    widget = widget_id,
                                    attempt,
                                    ?delay,
                                    %reason,
                                    "widget markup fetch failed, retrying"
                                );
                                tokio::time::sleep(delay).await;
                                RetryState::Attempting {
                                    attempt: attempt + 1,
                                }
                            } else {
                                warn!(
                                    widget = widget_id,
                                    attempts = attempt,
                                    %reason,
                                    "widget markup retries exhausted"
                                );
                                RetryState::RetriesExhausted
                            }
                        }
                    }
                }
                RetryState::RetriesExhausted => match self.cached_markup(&key).await {
                    Some(markup) => RetryState::UsingStaleCache(markup),
                    None => RetryState::UsingPlaceholder,
                },
                RetryState::Succeeded(markup) => {
                    self.persist(&key, &markup).await;
                    return MarkupOutcome::Fresh(markup);
                }
                RetryState::UsingStaleCache(markup) => {
                    warn!(widget = widget_id, "serving stale widget markup, update pending");
                    return MarkupOutcome::Stale(markup);
                }
                RetryState::UsingPlaceholder => {
                    info!(widget = widget_id, "no cached widget markup, serving placeholder");
                    return MarkupOutcome::Placeholder(self.placeholder.clone());
                }
            };
        }
    }

    async fn cached_markup(&self, key: &CacheKey) -> Option<String> {
        let store = self.cache.store().await;
        let record = match store.record(key).await {
            Ok(Some(record)) if record.is_complete() => record,
            Ok(_) => return None,
            Err(err) => {
                warn!(key = %key, error = %err, "cached widget markup unreadable");
                return None;
            }
        };
        let bytes = match store.read_all(&record).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key = %key, error = %err, "cached widget markup unreadable");
                return None;
            }
        };
        String::from_utf8(bytes)
            .ok()
            .filter(|markup| !markup.trim().is_empty())
    }

    async fn persist(&self, key: &CacheKey, markup: &str) {
        let store = self.cache.store().await;
        if let Err(err) = store
            .put_complete(key, content_type_for("html"), markup.as_bytes())
            .await
        {
            warn!(key = %key, error = %err, "failed to cache widget markup");
        }
    }
}
