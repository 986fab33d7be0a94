//! HTTP client for the embedding service.
//!
//! The service exposes three endpoints:
//!
//! - `POST /embed` with `{"texts": [...], "normalize": bool}` answering
//!   `{"embeddings": [[...]], "dimension", "count", "processing_time_ms"}`
//! - `GET /health` answering `{"status", "embedding_dimension"}`
//! - `GET /info` with free-form model metadata
//!
//! Errors are reported as `{"error": "..."}` with a 4xx/5xx status.

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use crate::provider::{EmbeddingProvider, EmbeddingResult, check_batch};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Longest error body kept in a [`EmbedError::ServiceError`] message.
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    texts: &'a [String],
    normalize: bool,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
    dimension: usize,
    count: usize,
    #[serde(default)]
    processing_time_ms: f64,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Answer of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }
}

/// Answer of `GET /info`. Only the commonly present fields are typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub embedding_dimension: Option<usize>,
    #[serde(default)]
    pub max_batch_size: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// [`EmbeddingProvider`] backed by the HTTP embedding service.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: Client,
    config: EmbedConfig,
    embed_url: String,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbedConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| EmbedError::invalid_config(format!("failed to build HTTP client: {e}")))?;
        let embed_url = config.endpoint("/embed");

        tracing::debug!(
            "Embedding client for {} (dimension {}, batch size {})",
            config.service_url,
            config.dimension,
            config.batch_size
        );

        Ok(Self {
            client,
            config,
            embed_url,
        })
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    /// Readiness probe, with the short health timeout.
    pub async fn health(&self) -> Result<HealthStatus> {
        let response = self
            .client
            .get(self.config.endpoint("/health"))
            .timeout(self.config.health_timeout())
            .send()
            .await
            .map_err(EmbedError::from_transport)?;
        let response = error_for_status(response).await?;
        response.json().await.map_err(EmbedError::from_transport)
    }

    /// `true` only if the service answers and reports itself healthy.
    pub async fn is_healthy(&self) -> bool {
        match self.health().await {
            Ok(status) => status.is_healthy(),
            Err(e) => {
                tracing::warn!("Embedding service health check failed: {}", e);
                false
            }
        }
    }

    /// Model and configuration metadata.
    pub async fn info(&self) -> Result<ServiceInfo> {
        let response = self
            .client
            .get(self.config.endpoint("/info"))
            .send()
            .await
            .map_err(EmbedError::from_transport)?;
        let response = error_for_status(response).await?;
        response.json().await.map_err(EmbedError::from_transport)
    }

    fn check_response(&self, texts: &[String], response: &EmbedResponse) -> Result<()> {
        if response.embeddings.len() != texts.len() || response.count != texts.len() {
            return Err(EmbedError::invalid_response(format!(
                "sent {} texts, got {} embeddings (count {})",
                texts.len(),
                response.embeddings.len(),
                response.count
            )));
        }
        let expected = self.config.dimension;
        if response.dimension != expected
            || response.embeddings.iter().any(|v| v.len() != expected)
        {
            return Err(EmbedError::invalid_response(format!(
                "expected dimension {expected}, service returned {}; changing the model needs a full reindex",
                response.dimension
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String], normalize: bool) -> Result<EmbeddingResult> {
        check_batch(texts)?;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.embed_url)
            .json(&EmbedRequest { texts, normalize })
            .send()
            .await
            .map_err(EmbedError::from_transport)?;
        let response = error_for_status(response).await?;
        let body: EmbedResponse = response.json().await.map_err(EmbedError::from_transport)?;
        self.check_response(texts, &body)?;

        tracing::debug!(
            "Embedded {} texts in {:?} (service reported {:.1}ms)",
            body.count,
            started.elapsed(),
            body.processing_time_ms
        );
        Ok(EmbeddingResult::from_f32(body.embeddings))
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn embedding_dimension(&self) -> usize {
        self.config.dimension
    }

    fn provider_name(&self) -> &str {
        "http"
    }
}

/// Turn a non-2xx response into [`EmbedError::ServiceError`] carrying its body.
async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => parsed.error,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string(),
        Err(_) => truncate(&body, MAX_ERROR_BODY),
    };
    Err(EmbedError::ServiceError {
        status: status.as_u16(),
        message,
    })
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
