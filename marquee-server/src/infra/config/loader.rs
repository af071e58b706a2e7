use once_cell::sync::Lazy;
use std::{fs, path::PathBuf, time::Duration};
use thiserror::Error;
use url::Url;

use marquee_core::{
    DEFAULT_CHUNK_SIZE,
    resilience::{BACKOFF_BASE_MS, MAX_ATTEMPTS},
    router::DEFAULT_LEGACY_ENDPOINT,
};

use super::{
    models::{
        CacheConfig, Config, ConfigMetadata, ConfigWarnings, OriginConfig,
        ResilienceConfig, ServerConfig,
    },
    sources::{EnvConfig, FileConfig},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("marquee.toml"),
        PathBuf::from("config/marquee.toml"),
    ]
});

const DEFAULT_ORIGIN: &str = "http://127.0.0.1:8080/";
const DEFAULT_WIDGET_PATH: &str = "widgets/{id}";
const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = EnvConfig::gather();
        let (file_config, config_path) = self.load_file_config(&env_config)?;

        Self::compose(
            file_config,
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        // An explicitly named file must exist; defaults are optional.
        let (path, explicit) = match (&self.options.config_path, &env_config.config_path) {
            (Some(path), _) | (None, Some(path)) => (path.clone(), true),
            (None, None) => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
            {
                Some(path) => (path.clone(), false),
                None => return Ok((None, None)),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|err| ConfigLoadError::Io {
                path: path.clone(),
                source: err,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|err| ConfigLoadError::Parse {
                path: path.clone(),
                source: err,
            })?;

        Ok((Some(file_config), Some(path)))
    }

    /// Merge sources: environment over file over defaults.
    pub fn compose(
        file_config: Option<FileConfig>,
        env: EnvConfig,
        metadata: ConfigMetadata,
    ) -> Result<ConfigLoad, ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();

        if metadata.config_path.is_none() {
            warnings.push_with_hint(
                "No marquee.toml detected; using environment variables and defaults",
                "Create marquee.toml or set MARQUEE_CONFIG",
            );
        }

        let FileConfig {
            server: file_server,
            origin: file_origin,
            cache: file_cache,
            resilience: file_resilience,
        } = file_config.unwrap_or_default();

        let server = ServerConfig {
            host: env
                .server_host
                .or(file_server.host)
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            port: env.server_port.or(file_server.port).unwrap_or(9696),
        };

        let raw_base = match env.origin_base_url.or(file_origin.base_url) {
            Some(raw) => raw,
            None => {
                warnings.push_with_hint(
                    format!("No origin configured; defaulting to {DEFAULT_ORIGIN}"),
                    "Set origin.base_url or ORIGIN_BASE_URL",
                );
                DEFAULT_ORIGIN.to_string()
            }
        };
        let origin = OriginConfig {
            base_url: parse_base_url(&raw_base)?,
            legacy_endpoint: env
                .origin_legacy_endpoint
                .or(file_origin.legacy_endpoint)
                .unwrap_or_else(|| DEFAULT_LEGACY_ENDPOINT.to_string()),
            widget_path: env
                .origin_widget_path
                .or(file_origin.widget_path)
                .unwrap_or_else(|| DEFAULT_WIDGET_PATH.to_string()),
            timeout: duration_field(
                "origin.timeout",
                env.origin_timeout.or(file_origin.timeout),
                DEFAULT_ORIGIN_TIMEOUT,
            )?,
        };
        if !origin.widget_path.contains("{id}") {
            warnings.push_with_hint(
                format!(
                    "Widget path '{}' has no {{id}} placeholder; every widget will fetch the same markup",
                    origin.widget_path
                ),
                "Use a template such as widgets/{id}",
            );
        }

        let chunk_size = env
            .cache_chunk_size
            .or(file_cache.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(ConfigLoadError::Invalid {
                field: "cache.chunk_size",
                reason: "must be greater than zero".into(),
            });
        }
        let cache = CacheConfig {
            root: env
                .cache_root
                .or(file_cache.root)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            generation: env
                .cache_generation
                .or(file_cache.generation)
                .unwrap_or_else(|| "v1".to_string()),
            chunk_size,
            retry_after: duration_field(
                "cache.retry_after",
                env.cache_retry_after.or(file_cache.retry_after),
                DEFAULT_RETRY_AFTER,
            )?,
        };

        let max_attempts = env
            .resilience_max_attempts
            .or(file_resilience.max_attempts)
            .unwrap_or(MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(ConfigLoadError::Invalid {
                field: "resilience.max_attempts",
                reason: "must be at least 1".into(),
            });
        }
        let resilience = ResilienceConfig {
            max_attempts,
            base_delay: duration_field(
                "resilience.base_delay",
                env.resilience_base_delay.or(file_resilience.base_delay),
                Duration::from_millis(BACKOFF_BASE_MS),
            )?,
            placeholder: env
                .resilience_placeholder
                .or(file_resilience.placeholder)
                .filter(|markup| !markup.trim().is_empty()),
        };

        Ok(ConfigLoad {
            config: Config {
                server,
                origin,
                cache,
                resilience,
                metadata,
            },
            warnings,
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigLoadError> {
    let mut url = Url::parse(raw)
        .map_err(|source| ConfigLoadError::InvalidOrigin { source })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn duration_field(
    field: &'static str,
    raw: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match raw {
        Some(raw) => humantime::parse_duration(&raw)
            .map_err(|source| ConfigLoadError::InvalidDuration { field, source }),
        None => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid origin base URL")]
    InvalidOrigin {
        #[source]
        source: url::ParseError,
    },
    #[error("invalid duration for {field}")]
    InvalidDuration {
        field: &'static str,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::sources::{FileCacheConfig, FileOriginConfig};

    fn with_path() -> ConfigMetadata {
        ConfigMetadata {
            config_path: Some(PathBuf::from("marquee.toml")),
            env_file_loaded: false,
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let ConfigLoad { config, warnings } =
            ConfigLoader::compose(None, EnvConfig::default(), ConfigMetadata::default())
                .unwrap();

        assert_eq!(config.server.port, 9696);
        assert_eq!(config.origin.base_url.as_str(), DEFAULT_ORIGIN);
        assert_eq!(config.origin.legacy_endpoint, "xmds.php");
        assert_eq!(config.cache.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.resilience.max_attempts, 3);
        assert_eq!(config.resilience.base_delay, Duration::from_secs(2));
        // Missing file and missing origin.
        assert_eq!(warnings.items.len(), 2);
    }

    #[test]
    fn environment_overrides_file_values() {
        let file = FileConfig {
            origin: FileOriginConfig {
                base_url: Some("https://file.example/cms".into()),
                timeout: Some("10s".into()),
                ..Default::default()
            },
            cache: FileCacheConfig {
                generation: Some("from-file".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let env = EnvConfig {
            cache_generation: Some("from-env".into()),
            ..Default::default()
        };

        let ConfigLoad { config, warnings } =
            ConfigLoader::compose(Some(file), env, with_path()).unwrap();

        assert_eq!(config.cache.generation, "from-env");
        assert_eq!(config.origin.base_url.as_str(), "https://file.example/cms/");
        assert_eq!(config.origin.timeout, Duration::from_secs(10));
        assert!(warnings.is_empty());
    }

    #[test]
    fn toml_sections_parse_into_file_config() {
        let raw = r#"
            [server]
            port = 8000

            [origin]
            base_url = "https://cms.example/"
            widget_path = "api/widgets/{id}/html"

            [cache]
            chunk_size = 1048576
            retry_after = "3s"

            [resilience]
            max_attempts = 5
            base_delay = "500ms"
        "#;
        let file: FileConfig = toml::from_str(raw).unwrap();
        let ConfigLoad { config, .. } =
            ConfigLoader::compose(Some(file), EnvConfig::default(), with_path()).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.origin.widget_path, "api/widgets/{id}/html");
        assert_eq!(config.cache.chunk_size, 1_048_576);
        assert_eq!(config.cache.retry_after, Duration::from_secs(3));
        assert_eq!(config.resilience.max_attempts, 5);
        assert_eq!(config.resilience.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn bad_values_are_rejected() {
        let env = EnvConfig {
            resilience_base_delay: Some("soon".into()),
            ..Default::default()
        };
        assert!(matches!(
            ConfigLoader::compose(None, env, with_path()),
            Err(ConfigLoadError::InvalidDuration {
                field: "resilience.base_delay",
                ..
            })
        ));

        let env = EnvConfig {
            cache_chunk_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            ConfigLoader::compose(None, env, with_path()),
            Err(ConfigLoadError::Invalid { .. })
        ));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .with_config_path(dir.path().join("absent.toml"))
            .with_env_file(dir.path().join(".env"))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
    }
}
