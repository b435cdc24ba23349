use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

const DEFAULT_EMBEDDING_API_URL: &str = "https://api.openai.com/v1/embeddings";
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_EMBEDDING_DIM: usize = 1536;
const DEFAULT_EMBEDDING_TIMEOUT_MS: u64 = 2000;
const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.92;
const DEFAULT_TOP_K: usize = 10;
const DEFAULT_MAX_ENTRIES: u64 = 10_000;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;

/// Where cache entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    Postgres,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(CacheBackend::Postgres),
            "memory" => Ok(CacheBackend::Memory),
            other => bail!("CACHE_BACKEND must be 'postgres' or 'memory', got '{other}'"),
        }
    }
}

/// Tuning knobs shared by the lookup engine and the eviction manager.
/// Built once at startup and passed explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    /// Minimum cosine similarity for a semantic-tier hit.
    pub semantic_similarity_threshold: f32,
    /// Neighbours fetched before post-filtering.
    pub semantic_top_k: usize,
    pub embedding_timeout: Duration,
    /// Generation model versions whose entries must never be served.
    pub retired_model_versions: Vec<String>,
    pub max_entries: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            semantic_similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            semantic_top_k: DEFAULT_TOP_K,
            embedding_timeout: Duration::from_millis(DEFAULT_EMBEDDING_TIMEOUT_MS),
            retired_model_versions: Vec::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// External embedding service. Absent when no API key is configured.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

/// Application configuration loaded from environment variables.
/// Startup fails if a required variable is missing or malformed.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: CacheBackend,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub embedding: Option<EmbeddingConfig>,
    pub embedding_dimension: usize,
    pub archetype_map_path: Option<PathBuf>,
    pub maintenance_interval: Duration,
    pub cache: CacheSettings,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup. `from_env` passes the process env.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let backend: CacheBackend = match var("CACHE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => CacheBackend::Postgres,
        };

        let database_url = var("DATABASE_URL");
        if backend == CacheBackend::Postgres && database_url.is_none() {
            bail!("Required environment variable 'DATABASE_URL' is not set");
        }

        let embedding = var("EMBEDDING_API_KEY").map(|api_key| EmbeddingConfig {
            api_url: var("EMBEDDING_API_URL")
                .unwrap_or_else(|| DEFAULT_EMBEDDING_API_URL.to_string()),
            api_key,
            model: var("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        });

        let embedding_dimension: usize =
            parse_or(var("EMBEDDING_DIM"), DEFAULT_EMBEDDING_DIM, "EMBEDDING_DIM")?;
        if embedding_dimension == 0 {
            bail!("EMBEDDING_DIM must be greater than zero");
        }

        let timeout_ms: u64 = parse_or(
            var("EMBEDDING_TIMEOUT_MS"),
            DEFAULT_EMBEDDING_TIMEOUT_MS,
            "EMBEDDING_TIMEOUT_MS",
        )?;
        if timeout_ms == 0 {
            bail!("EMBEDDING_TIMEOUT_MS must be greater than zero");
        }

        let threshold: f32 = parse_or(
            var("SEMANTIC_SIMILARITY_THRESHOLD"),
            DEFAULT_SIMILARITY_THRESHOLD,
            "SEMANTIC_SIMILARITY_THRESHOLD",
        )?;
        if !(-1.0..=1.0).contains(&threshold) {
            bail!("SEMANTIC_SIMILARITY_THRESHOLD must be within [-1, 1], got {threshold}");
        }

        let top_k: usize = parse_or(var("SEMANTIC_TOP_K"), DEFAULT_TOP_K, "SEMANTIC_TOP_K")?;
        if top_k == 0 {
            bail!("SEMANTIC_TOP_K must be at least 1");
        }

        let max_entries: u64 =
            parse_or(var("CACHE_MAX_ENTRIES"), DEFAULT_MAX_ENTRIES, "CACHE_MAX_ENTRIES")?;
        if max_entries == 0 {
            bail!("CACHE_MAX_ENTRIES must be at least 1");
        }

        let interval_secs: u64 = parse_or(
            var("MAINTENANCE_INTERVAL_SECS"),
            DEFAULT_MAINTENANCE_INTERVAL_SECS,
            "MAINTENANCE_INTERVAL_SECS",
        )?;
        if interval_secs == 0 {
            bail!("MAINTENANCE_INTERVAL_SECS must be at least 1");
        }

        Ok(Config {
            backend,
            database_url,
            redis_url: var("REDIS_URL"),
            embedding,
            embedding_dimension,
            archetype_map_path: var("ARCHETYPE_MAP_PATH").map(PathBuf::from),
            maintenance_interval: Duration::from_secs(interval_secs),
            cache: CacheSettings {
                semantic_similarity_threshold: threshold,
                semantic_top_k: top_k,
                embedding_timeout: Duration::from_millis(timeout_ms),
                retired_model_versions: parse_csv(var("RETIRED_MODEL_VERSIONS").as_deref()),
                max_entries,
            },
            port: parse_or(var("PORT"), 8080, "PORT")?,
            rust_log: var("RUST_LOG").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse_or<T>(raw: Option<String>, default: T, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has invalid value '{raw}'")),
        None => Ok(default),
    }
}

/// Splits a comma-separated list, dropping blanks.
fn parse_csv(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults_for_memory_backend() {
        let config = config_from(&[("CACHE_BACKEND", "memory")]).unwrap();
        assert_eq!(config.backend, CacheBackend::Memory);
        assert!(config.database_url.is_none());
        assert!(config.embedding.is_none());
        assert_eq!(config.embedding_dimension, 1536);
        assert_eq!(config.cache, CacheSettings::default());
        assert_eq!(config.maintenance_interval, Duration::from_secs(300));
        assert_eq!(config.port, 8080);
        assert_eq!(config.rust_log, "info");
    }

    #[test]
    fn test_postgres_backend_requires_database_url() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let config = config_from(&[("DATABASE_URL", "postgres://localhost/cache")]).unwrap();
        assert_eq!(config.backend, CacheBackend::Postgres);
    }

    #[test]
    fn test_embedding_enabled_by_api_key() {
        let config = config_from(&[
            ("CACHE_BACKEND", "memory"),
            ("EMBEDDING_API_KEY", "sk-test"),
            ("EMBEDDING_MODEL", "custom-embed"),
            ("EMBEDDING_DIM", "384"),
        ])
        .unwrap();
        let embedding = config.embedding.unwrap();
        assert_eq!(embedding.model, "custom-embed");
        assert_eq!(embedding.api_url, DEFAULT_EMBEDDING_API_URL);
        assert_eq!(config.embedding_dimension, 384);
    }

    #[test]
    fn test_cache_settings_from_env() {
        let config = config_from(&[
            ("CACHE_BACKEND", "memory"),
            ("SEMANTIC_SIMILARITY_THRESHOLD", "0.85"),
            ("SEMANTIC_TOP_K", "3"),
            ("EMBEDDING_TIMEOUT_MS", "750"),
            ("RETIRED_MODEL_VERSIONS", " gen-v1, ,gen-v2 "),
            ("CACHE_MAX_ENTRIES", "50"),
        ])
        .unwrap();
        assert_eq!(config.cache.semantic_similarity_threshold, 0.85);
        assert_eq!(config.cache.semantic_top_k, 3);
        assert_eq!(config.cache.embedding_timeout, Duration::from_millis(750));
        assert_eq!(
            config.cache.retired_model_versions,
            vec!["gen-v1".to_string(), "gen-v2".to_string()]
        );
        assert_eq!(config.cache.max_entries, 50);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        for (key, value) in [
            ("SEMANTIC_SIMILARITY_THRESHOLD", "1.5"),
            ("SEMANTIC_TOP_K", "0"),
            ("EMBEDDING_DIM", "0"),
            ("EMBEDDING_TIMEOUT_MS", "abc"),
            ("CACHE_BACKEND", "sqlite"),
            ("PORT", "99999"),
        ] {
            assert!(
                config_from(&[("CACHE_BACKEND", "memory"), (key, value)]).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_csv_handles_missing_and_blank() {
        assert!(parse_csv(None).is_empty());
        assert!(parse_csv(Some(" , ")).is_empty());
        assert_eq!(parse_csv(Some("a,b")), vec!["a".to_string(), "b".to_string()]);
    }
}
