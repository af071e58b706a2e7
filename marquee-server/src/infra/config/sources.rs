use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub origin: FileOriginConfig,
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub resilience: FileResilienceConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileOriginConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub legacy_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub widget_path: Option<String>,
    /// Humantime duration, e.g. `"30s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCacheConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileResilienceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
}

/// Environment-derived configuration values.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub origin_base_url: Option<String>,
    pub origin_legacy_endpoint: Option<String>,
    pub origin_widget_path: Option<String>,
    pub origin_timeout: Option<String>,
    pub cache_root: Option<PathBuf>,
    pub cache_generation: Option<String>,
    pub cache_chunk_size: Option<u64>,
    pub cache_retry_after: Option<String>,
    pub resilience_max_attempts: Option<u16>,
    pub resilience_base_delay: Option<String>,
    pub resilience_placeholder: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        let mut env_config = Self::default();

        env_config.config_path =
            std::env::var("MARQUEE_CONFIG").ok().map(PathBuf::from);
        env_config.server_host = std::env::var("SERVER_HOST").ok();
        env_config.server_port = std::env::var("SERVER_PORT")
            .ok()
            .and_then(|s| s.parse().ok());

        env_config.origin_base_url = non_empty_var("ORIGIN_BASE_URL");
        env_config.origin_legacy_endpoint =
            non_empty_var("ORIGIN_LEGACY_ENDPOINT");
        env_config.origin_widget_path = non_empty_var("ORIGIN_WIDGET_PATH");
        env_config.origin_timeout = non_empty_var("ORIGIN_TIMEOUT");

        env_config.cache_root =
            std::env::var("CACHE_DIR").ok().map(PathBuf::from);
        env_config.cache_generation = non_empty_var("CACHE_GENERATION");
        env_config.cache_chunk_size = std::env::var("CACHE_CHUNK_SIZE")
            .ok()
            .and_then(|s| s.parse().ok());
        env_config.cache_retry_after = non_empty_var("CACHE_RETRY_AFTER");

        env_config.resilience_max_attempts =
            std::env::var("RESILIENCE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok());
        env_config.resilience_base_delay = non_empty_var("RESILIENCE_BASE_DELAY");
        env_config.resilience_placeholder =
            non_empty_var("RESILIENCE_PLACEHOLDER");

        env_config
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
