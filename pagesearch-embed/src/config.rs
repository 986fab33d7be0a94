//! Configuration for the embedding service client

use crate::error::{EmbedError, Result};
use crate::provider::MAX_TEXTS_PER_REQUEST;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SERVICE_URL: &str = "http://localhost:8001";
pub const DEFAULT_MODEL_NAME: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_DIMENSION: usize = 384;

/// Connection and batching settings for the embedding service.
///
/// The dimension is not negotiated with the service: it is a property of the whole
/// index, and a response with any other dimension is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into))]
#[serde(default)]
pub struct EmbedConfig {
    /// Base URL of the service, e.g. `http://localhost:8001`
    #[builder(default = "DEFAULT_SERVICE_URL.to_string()")]
    pub service_url: String,
    /// Model served behind the URL, recorded alongside the index
    #[builder(default = "DEFAULT_MODEL_NAME.to_string()")]
    pub model_name: String,
    /// Timeout for `/embed` and `/info` requests, in seconds
    #[builder(default = "30")]
    pub timeout_secs: u64,
    /// Timeout for `/health`, in seconds
    #[builder(default = "5")]
    pub health_timeout_secs: u64,
    /// Texts per request when splitting a large list
    #[builder(default = "32")]
    pub batch_size: usize,
    /// Length of every returned vector
    #[builder(default = "DEFAULT_DIMENSION")]
    pub dimension: usize,
    /// Whether to ask the service for unit-length vectors
    #[builder(default = "true")]
    pub normalize: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
            timeout_secs: 30,
            health_timeout_secs: 5,
            batch_size: 32,
            dimension: DEFAULT_DIMENSION,
            normalize: true,
        }
    }
}

impl EmbedConfig {
    /// Create a new embedding configuration using the builder
    pub fn builder() -> EmbedConfigBuilder {
        EmbedConfigBuilder::default()
    }

    /// Default settings pointed at `service_url`.
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            ..Self::default()
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set the expected vector dimension (builder style)
    pub fn with_dimension(self, dimension: usize) -> Self {
        Self { dimension, ..self }
    }

    /// Set the request timeout (builder style)
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            timeout_secs: timeout.as_secs().max(1),
            ..self
        }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// Full URL of an endpoint such as `/embed`.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.service_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Apply `EMBEDDING_*` environment variables on top of this configuration.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source.
    ///
    /// Recognised keys: `EMBEDDING_SERVICE_URL`, `EMBEDDING_MODEL_NAME`,
    /// `EMBEDDING_TIMEOUT`, `EMBEDDING_BATCH_SIZE`, `EMBEDDING_DIMENSION`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("EMBEDDING_SERVICE_URL") {
            self.service_url = url;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL_NAME") {
            self.model_name = model;
        }
        if let Some(value) = lookup("EMBEDDING_TIMEOUT") {
            self.timeout_secs = parse_number("EMBEDDING_TIMEOUT", &value)?;
        }
        if let Some(value) = lookup("EMBEDDING_BATCH_SIZE") {
            self.batch_size = parse_number("EMBEDDING_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("EMBEDDING_DIMENSION") {
            self.dimension = parse_number("EMBEDDING_DIMENSION", &value)?;
        }
        Ok(self)
    }

    /// Check the settings before a client is built from them.
    pub fn validate(&self) -> Result<()> {
        let url = self.service_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(EmbedError::invalid_config(format!(
                "service_url must be an http(s) URL, got {:?}",
                self.service_url
            )));
        }
        if self.batch_size == 0 || self.batch_size > MAX_TEXTS_PER_REQUEST {
            return Err(EmbedError::invalid_config(format!(
                "batch_size must be between 1 and {MAX_TEXTS_PER_REQUEST}, got {}",
                self.batch_size
            )));
        }
        if self.dimension == 0 {
            return Err(EmbedError::invalid_config("dimension must be positive"));
        }
        if self.timeout_secs == 0 || self.health_timeout_secs == 0 {
            return Err(EmbedError::invalid_config("timeouts must be positive"));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EmbedError::invalid_config(format!("{key} is not a number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EmbedConfig::default();
        assert_eq!(config.service_url, "http://localhost:8001");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.health_timeout(), Duration::from_secs(5));
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.dimension, 384);
        assert!(config.normalize);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_defaults_match_default() {
        let built = EmbedConfig::builder().build().unwrap();
        assert_eq!(built, EmbedConfig::default());
    }

    #[test]
    fn test_builder_overrides() {
        let config = EmbedConfig::builder()
            .service_url("http://embed:9000/")
            .batch_size(64usize)
            .dimension(768usize)
            .normalize(false)
            .build()
            .unwrap();

        assert_eq!(config.batch_size, 64);
        assert_eq!(config.dimension, 768);
        assert!(!config.normalize);
        assert_eq!(config.endpoint("/embed"), "http://embed:9000/embed");
        assert_eq!(config.endpoint("health"), "http://embed:9000/health");
    }

    #[test]
    fn test_with_methods() {
        let config = EmbedConfig::new("http://127.0.0.1:1")
            .with_batch_size(8)
            .with_dimension(3)
            .with_timeout(Duration::from_millis(10))
            .with_normalize(false);

        assert_eq!(config.batch_size, 8);
        assert_eq!(config.dimension, 3);
        assert_eq!(config.timeout_secs, 1);
        assert!(!config.normalize);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("EMBEDDING_SERVICE_URL", "http://embeddings:8001"),
            ("EMBEDDING_TIMEOUT", "12"),
            ("EMBEDDING_BATCH_SIZE", " 16 "),
        ]);
        let config = EmbedConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.service_url, "http://embeddings:8001");
        assert_eq!(config.timeout_secs, 12);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.dimension, 384);
    }

    #[test]
    fn test_override_rejects_garbage() {
        let err = EmbedConfig::default()
            .with_overrides(|key| (key == "EMBEDDING_DIMENSION").then(|| "wide".to_string()))
            .unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validate() {
        assert!(EmbedConfig::new("localhost:8001").validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(0).validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(1001).validate().is_err());
        assert!(EmbedConfig::default().with_batch_size(1000).validate().is_ok());
        assert!(EmbedConfig::default().with_dimension(0).validate().is_err());
    }

    #[test]
    fn test_partial_document() {
        let config: EmbedConfig = serde_json::from_str(r#"{"service_url": "http://x:1"}"#).unwrap();
        assert_eq!(config.service_url, "http://x:1");
        assert_eq!(config.batch_size, 32);
    }
}
