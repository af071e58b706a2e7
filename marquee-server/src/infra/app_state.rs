use std::{fmt, sync::Arc};

use anyhow::Context;
use marquee_core::{
    CacheManager, ChunkFetcher, Classifier, HttpOrigin, OriginMarkupSource, Origin,
    RequestRouter, RequiredFiles, RetryPolicy, RouterSettings, SyncIngest,
    WidgetMarkupService,
};
use tracing::info;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: Arc<CacheManager>,
    pub required: Arc<RequiredFiles>,
    pub router: Arc<RequestRouter>,
    pub widgets: Arc<WidgetMarkupService>,
    pub sync: SyncIngest,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire everything against the configured HTTP origin.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let origin = HttpOrigin::new(
            config.origin.base_url.clone(),
            config.origin.timeout,
        )
        .context("failed to build origin client")?;
        Self::with_origin(config, Arc::new(origin)).await
    }

    /// Wire everything against `origin`; tests pass an in-memory one.
    pub async fn with_origin(
        config: Config,
        origin: Arc<dyn Origin>,
    ) -> anyhow::Result<Self> {
        let cache = Arc::new(
            CacheManager::open(&config.cache.root, &config.cache.generation)
                .await
                .with_context(|| {
                    format!(
                        "failed to open cache at {}",
                        config.cache.root.display()
                    )
                })?,
        );
        let required = Arc::new(RequiredFiles::new());
        let fetcher = ChunkFetcher::new(origin.clone(), config.cache.chunk_size);

        let router = RequestRouter::new(
            cache.clone(),
            required.clone(),
            origin.clone(),
            fetcher.clone(),
            Classifier::new(&config.origin.legacy_endpoint),
            RouterSettings {
                origin_base: config.origin.base_url.clone(),
                retry_after: config.cache.retry_after,
            },
        );

        let source = OriginMarkupSource::new(
            origin,
            config.origin.base_url.clone(),
            config.origin.widget_path.clone(),
        );
        let policy = RetryPolicy {
            max_attempts: config.resilience.max_attempts,
            backoff_base_ms: config.resilience.base_delay.as_millis() as u64,
        };
        let mut widgets =
            WidgetMarkupService::new(Arc::new(source), cache.clone(), policy);
        if let Some(placeholder) = &config.resilience.placeholder {
            widgets = widgets.with_placeholder(placeholder.clone());
        }

        let sync = SyncIngest::new(cache.clone(), required.clone(), fetcher);

        info!(
            origin = %config.origin.base_url,
            cache = %config.cache.root.display(),
            generation = %config.cache.generation,
            "application state ready"
        );

        Ok(Self {
            config: Arc::new(config),
            cache,
            required,
            router: Arc::new(router),
            widgets: Arc::new(widgets),
            sync,
        })
    }
}
