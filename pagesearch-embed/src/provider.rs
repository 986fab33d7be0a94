//! The embedding provider abstraction

use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use half::f16;

/// Most texts the service accepts in one `/embed` request.
pub const MAX_TEXTS_PER_REQUEST: usize = 1000;

/// Result of embedding generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of f16 embeddings.
    ///
    /// The dimension is inferred from the first embedding vector, or 0 when empty.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Convert wire-format `f32` vectors.
    pub fn from_f32(embeddings: Vec<Vec<f32>>) -> Self {
        Self::new(
            embeddings
                .into_iter()
                .map(|v| v.into_iter().map(f16::from_f32).collect())
                .collect(),
        )
    }

    /// Returns the number of embedding vectors in this result.
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    /// Returns `true` if this result contains no embedding vectors.
    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    fn append(&mut self, other: EmbeddingResult) {
        if self.dimension == 0 {
            self.dimension = other.dimension;
        }
        self.embeddings.extend(other.embeddings);
    }
}

/// Something that turns texts into vectors.
///
/// Implementors supply [`embed`](EmbeddingProvider::embed), a single request of at
/// most [`MAX_TEXTS_PER_REQUEST`] texts. Splitting larger lists is provided by
/// [`embed_batched`](EmbeddingProvider::embed_batched).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one batch. Fails with [`EmbedError::BadRequest`] for an empty batch or
    /// one larger than [`MAX_TEXTS_PER_REQUEST`].
    async fn embed(&self, texts: &[String], normalize: bool) -> Result<EmbeddingResult>;

    /// Default number of texts per request for [`embed_batched`](Self::embed_batched).
    fn batch_size(&self) -> usize;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;

    /// Embed a single text.
    async fn embed_text(&self, text: &str, normalize: bool) -> Result<Vec<f16>> {
        let texts = [text.to_string()];
        let result = self.embed(&texts, normalize).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::invalid_response("no embedding returned for text"))
    }

    /// Embed any number of texts in sub-batches, preserving order.
    ///
    /// `batch_size` falls back to [`batch_size`](Self::batch_size) and is clamped to
    /// `1..=MAX_TEXTS_PER_REQUEST`. The first failing sub-batch fails the whole call.
    /// An empty list succeeds without calling [`embed`](Self::embed).
    async fn embed_batched(
        &self,
        texts: &[String],
        batch_size: Option<usize>,
        normalize: bool,
    ) -> Result<EmbeddingResult> {
        let mut combined = EmbeddingResult {
            embeddings: Vec::with_capacity(texts.len()),
            dimension: 0,
        };
        if texts.is_empty() {
            return Ok(combined);
        }

        let size = batch_size
            .unwrap_or_else(|| self.batch_size())
            .clamp(1, MAX_TEXTS_PER_REQUEST);
        let batches = texts.len().div_ceil(size);

        for (i, batch) in texts.chunks(size).enumerate() {
            tracing::debug!(
                "{}: embedding batch {}/{} ({} texts)",
                self.provider_name(),
                i + 1,
                batches,
                batch.len()
            );
            let result = self.embed(batch, normalize).await?;
            combined.append(result);
        }

        Ok(combined)
    }
}

/// Reject batches the service would refuse.
pub fn check_batch(texts: &[String]) -> Result<()> {
    if texts.is_empty() {
        return Err(EmbedError::bad_request("No texts provided"));
    }
    if texts.len() > MAX_TEXTS_PER_REQUEST {
        return Err(EmbedError::bad_request(format!(
            "Too many texts ({}); max {MAX_TEXTS_PER_REQUEST} per request",
            texts.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_embedding_result() {
        let result = EmbeddingResult::from_f32(vec![vec![0.1, 0.2, 0.3], vec![0.4, 0.5, 0.6]]);
        assert_eq!(result.len(), 2);
        assert_eq!(result.dimension, 3);
        assert!(!result.is_empty());
        assert!((result.embeddings[1][2].to_f32() - 0.6).abs() < 1e-3);

        let empty = EmbeddingResult::new(vec![]);
        assert!(empty.is_empty());
        assert_eq!(empty.dimension, 0);
    }

    #[test]
    fn test_check_batch() {
        assert!(matches!(check_batch(&[]), Err(EmbedError::BadRequest { .. })));
        let too_many = vec!["x".to_string(); MAX_TEXTS_PER_REQUEST + 1];
        assert!(matches!(check_batch(&too_many), Err(EmbedError::BadRequest { .. })));
        let max = vec!["x".to_string(); MAX_TEXTS_PER_REQUEST];
        assert!(check_batch(&max).is_ok());
    }

    /// Encodes each text's length and records the batch sizes it was called with.
    struct LengthProvider {
        calls: Mutex<Vec<usize>>,
        fail_on_call: Option<usize>,
    }

    impl LengthProvider {
        fn new(fail_on_call: Option<usize>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on_call,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LengthProvider {
        async fn embed(&self, texts: &[String], _normalize: bool) -> Result<EmbeddingResult> {
            check_batch(texts)?;
            let call = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(texts.len());
                calls.len()
            };
            if self.fail_on_call == Some(call) {
                return Err(EmbedError::service_unavailable("scripted failure"));
            }
            Ok(EmbeddingResult::from_f32(
                texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect(),
            ))
        }

        fn batch_size(&self) -> usize {
            3
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "length"
        }
    }

    fn texts(n: usize) -> Vec<String> {
        (1..=n).map(|i| "a".repeat(i)).collect()
    }

    #[tokio::test]
    async fn test_embed_batched_preserves_order() {
        let provider = LengthProvider::new(None);
        let result = provider.embed_batched(&texts(7), None, true).await.unwrap();

        assert_eq!(*provider.calls.lock().unwrap(), vec![3, 3, 1]);
        assert_eq!(result.len(), 7);
        assert_eq!(result.dimension, 2);
        let lengths: Vec<f32> = result.embeddings.iter().map(|v| v[0].to_f32()).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[tokio::test]
    async fn test_embed_batched_explicit_size() {
        let provider = LengthProvider::new(None);
        provider.embed_batched(&texts(5), Some(2), false).await.unwrap();
        assert_eq!(*provider.calls.lock().unwrap(), vec![2, 2, 1]);

        let provider = LengthProvider::new(None);
        provider.embed_batched(&texts(2), Some(0), false).await.unwrap();
        assert_eq!(*provider.calls.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_embed_batched_fails_fast() {
        let provider = LengthProvider::new(Some(2));
        let err = provider.embed_batched(&texts(9), None, true).await.unwrap_err();

        assert!(err.is_unavailable());
        // The third batch is never sent.
        assert_eq!(provider.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_embed_batched_empty() {
        let provider = LengthProvider::new(None);
        let result = provider.embed_batched(&[], None, true).await.unwrap();
        assert!(result.is_empty());
        assert!(provider.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_text() {
        let provider = LengthProvider::new(None);
        let vector = provider.embed_text("abcd", true).await.unwrap();
        assert_eq!(vector[0].to_f32(), 4.0);
    }
}
