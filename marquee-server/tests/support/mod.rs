#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum_test::TestServer;
use marquee_core::{CacheError, Origin, OriginRequest, OriginResponse};
use marquee_server::{
    AppState, create_app,
    infra::config::{
        CacheConfig, Config, ConfigMetadata, OriginConfig, ResilienceConfig, ServerConfig,
    },
};
use tempfile::TempDir;
use url::Url;

pub const BASE: &str = "https://cms.test/";

/// Origin backed by a map of `path?query` targets. Honors single ranges.
#[derive(Debug, Default)]
pub struct StaticOrigin {
    files: Mutex<HashMap<String, (String, Vec<u8>)>>,
    hits: Mutex<Vec<String>>,
}

impl StaticOrigin {
    pub fn serve(&self, target: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .unwrap()
            .insert(target.to_string(), (content_type.to_string(), body.into()));
    }

    pub fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Origin for StaticOrigin {
    async fn fetch(&self, request: OriginRequest) -> marquee_core::Result<OriginResponse> {
        let path = request.url.path().trim_start_matches('/');
        let target = match request.url.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        };
        self.hits.lock().unwrap().push(target.clone());

        let Some((content_type, body)) = self.files.lock().unwrap().get(&target).cloned()
        else {
            return Ok(OriginResponse {
                status: StatusCode::NOT_FOUND,
                headers: HeaderMap::new(),
                body: Vec::new(),
            });
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .map_err(|e| CacheError::Origin(e.to_string()))?,
        );
        let total = body.len() as u64;
        match request.range.and_then(|spec| spec.resolve(total).ok()) {
            Some(range) => {
                headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&format!(
                        "bytes {}-{}/{total}",
                        range.start, range.end
                    ))
                    .map_err(|e| CacheError::Origin(e.to_string()))?,
                );
                Ok(OriginResponse {
                    status: StatusCode::PARTIAL_CONTENT,
                    headers,
                    body: body[range.start as usize..=range.end as usize].to_vec(),
                })
            }
            None => Ok(OriginResponse {
                status: StatusCode::OK,
                headers,
                body,
            }),
        }
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub origin: Arc<StaticOrigin>,
    _dir: TempDir,
}

pub fn test_config(root: &std::path::Path) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        origin: OriginConfig {
            base_url: Url::parse(BASE).unwrap(),
            legacy_endpoint: "xmds.php".into(),
            widget_path: "widgets/{id}".into(),
            timeout: Duration::from_secs(5),
        },
        cache: CacheConfig {
            root: root.to_path_buf(),
            generation: "v1".into(),
            chunk_size: 1024,
            retry_after: Duration::from_secs(2),
        },
        resilience: ResilienceConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            placeholder: None,
        },
        metadata: ConfigMetadata::default(),
    }
}

pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(StaticOrigin::default());
    let state = AppState::with_origin(test_config(dir.path()), origin.clone())
        .await
        .unwrap();
    let server = TestServer::new(create_app(state.clone())).unwrap();
    TestApp {
        server,
        state,
        origin,
        _dir: dir,
    }
}

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
