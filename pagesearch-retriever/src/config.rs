//! Layered configuration for the `pagesearch` binary and server.
//!
//! Values are resolved in this order, later layers winning:
//!
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables (`PAGESEARCH_DATABASE`, `EMBEDDING_*`)
//! 4. command line flags, applied by the caller
//!
//! ```toml
//! [database]
//! path = "pagesearch.db"
//!
//! [embedding]
//! service_url = "http://localhost:8001"
//! dimension = 384
//!
//! [chunking]
//! max_tokens = 256
//! overlap_tokens = 50
//!
//! [queue]
//! max_workers = 4
//!
//! [search]
//! default_semantic_weight = 0.7
//! ```

use crate::retrieval::task_queue::TaskQueueConfig;
use crate::search::SearchSettings;
use anyhow::{Context, Result, bail};
use pagesearch_context::markdown::{ChunkerConfig, DEFAULT_MAX_TOKENS, DEFAULT_OVERLAP_TOKENS};
use pagesearch_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DATABASE_PATH: &str = "pagesearch.db";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagesearchConfig {
    pub database: DatabaseConfig,
    pub embedding: EmbedConfig,
    pub chunking: ChunkingConfig,
    pub queue: QueueConfig,
    pub search: SearchSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_DATABASE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    /// HuggingFace `tokenizer.json`. Without it tokens are estimated from words.
    pub tokenizer_path: Option<PathBuf>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            overlap_tokens: DEFAULT_OVERLAP_TOKENS,
            tokenizer_path: None,
        }
    }
}

impl ChunkingConfig {
    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig::new(self.max_tokens, self.overlap_tokens)
    }
}

/// Serializable form of [`TaskQueueConfig`], with durations in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub max_queue_size: usize,
    pub job_timeout_secs: u64,
    pub result_ttl_secs: u64,
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let defaults = TaskQueueConfig::default();
        Self {
            max_workers: defaults.max_workers,
            max_queue_size: defaults.max_queue_size,
            job_timeout_secs: defaults.job_timeout.as_secs(),
            result_ttl_secs: defaults.result_ttl.as_secs(),
            max_retries: defaults.max_retries,
        }
    }
}

impl From<&QueueConfig> for TaskQueueConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_queue_size: config.max_queue_size,
            max_workers: config.max_workers,
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            result_ttl: Duration::from_secs(config.result_ttl_secs),
            max_retries: config.max_retries,
        }
    }
}

impl PagesearchConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Apply environment-style overrides from any key/value source.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("PAGESEARCH_DATABASE") {
            self.database.path = PathBuf::from(path);
        }
        self.embedding = self.embedding.with_overrides(&lookup)?;
        Ok(self)
    }

    pub fn task_queue_config(&self) -> TaskQueueConfig {
        TaskQueueConfig::from(&self.queue)
    }

    pub fn validate(&self) -> Result<()> {
        self.embedding.validate()?;
        if self.chunking.max_tokens == 0 {
            bail!("chunking.max_tokens must be positive");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            bail!(
                "chunking.overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.chunking.overlap_tokens,
                self.chunking.max_tokens
            );
        }
        if self.queue.max_workers == 0 || self.queue.max_queue_size == 0 {
            bail!("queue.max_workers and queue.max_queue_size must be positive");
        }
        if self.queue.job_timeout_secs == 0 {
            bail!("queue.job_timeout_secs must be positive");
        }
        let search = &self.search;
        if search.max_limit == 0 || search.default_limit == 0 {
            bail!("search limits must be positive");
        }
        for (name, value) in [
            ("default_threshold", search.default_threshold),
            ("default_semantic_weight", search.default_semantic_weight),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("search.{name} must be between 0 and 1, got {value}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = PagesearchConfig::default();
        assert_eq!(config.database.path, PathBuf::from("pagesearch.db"));
        assert_eq!(config.embedding.service_url, "http://localhost:8001");
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.chunking.max_tokens, 256);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.queue.max_workers, 4);
        assert_eq!(config.queue.job_timeout_secs, 600);
        assert_eq!(config.queue.result_ttl_secs, 86400);
        assert_eq!(config.search.default_limit, 20);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pagesearch.toml");
        std::fs::write(
            &path,
            r#"
            [embedding]
            service_url = "http://embed:9000"

            [queue]
            max_workers = 2
            job_timeout_secs = 30

            [search]
            default_semantic_weight = 0.4
            "#,
        )
        .unwrap();

        let config = PagesearchConfig::from_file(&path).unwrap();
        assert_eq!(config.embedding.service_url, "http://embed:9000");
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.queue.max_workers, 2);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.search.default_semantic_weight, 0.4);
        assert_eq!(config.search.max_limit, 100);

        let queue = config.task_queue_config();
        assert_eq!(queue.job_timeout, Duration::from_secs(30));
        assert_eq!(queue.max_workers, 2);
    }

    #[test]
    fn test_environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("PAGESEARCH_DATABASE", "/var/lib/pagesearch/index.db"),
            ("EMBEDDING_SERVICE_URL", "http://other:8001"),
            ("EMBEDDING_DIMENSION", "768"),
        ]
        .into_iter()
        .collect();

        let config = PagesearchConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/pagesearch/index.db"));
        assert_eq!(config.embedding.service_url, "http://other:8001");
        assert_eq!(config.embedding.dimension, 768);
    }

    #[test]
    fn test_bad_override_is_an_error() {
        let result = PagesearchConfig::default()
            .with_overrides(|key| (key == "EMBEDDING_BATCH_SIZE").then(|| "lots".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PagesearchConfig::default();
        config.chunking.overlap_tokens = 256;
        assert!(config.validate().is_err());

        let mut config = PagesearchConfig::default();
        config.search.default_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = PagesearchConfig::default();
        config.embedding.service_url = "localhost:8001".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = PagesearchConfig::from_file(Path::new("/nonexistent/pagesearch.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("reading config file"));
    }
}
