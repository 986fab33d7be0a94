//! Chunk, embed and persist one document.
//!
//! [`DocumentIndexer::index`] is the single code path behind direct indexing, queued
//! jobs and bulk reindexing. It owns the status transitions of one run:
//!
//! ```text
//! load ─► processing ─► (skip if chunks exist and not forced) ─► completed
//!                    └► chunk ─► embed ─► verify count ─► replace chunks ─► completed
//!                                  any failure after "processing" ─────────► failed
//! ```
//!
//! A forced run deletes the previous chunks in the same transaction that inserts the
//! new ones, so a run that fails before that point keeps the old chunk set.

use crate::storage::{ChunkStore, DocumentId, DocumentStore, EmbeddingStatus, IndexStore, NewChunk};
use pagesearch_context::{MarkdownChunker, TextChunk};
use pagesearch_embed::{EmbedError, EmbeddingProvider};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything that ends an indexing run early.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("document {0} not found")]
    NotFound(DocumentId),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbedError),

    /// The embedding capability returned a different number of vectors than chunks.
    #[error("integrity violation: {actual} vectors for {expected} chunks")]
    IntegrityViolation { expected: usize, actual: usize },

    #[error("chunking task failed: {0}")]
    Chunking(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// What a successful run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IndexOutcome {
    /// Chunks were (re)generated.
    Indexed { chunks: usize },
    /// Not forced and chunks already existed; only the status was refreshed.
    Skipped { existing_chunks: usize },
}

impl IndexOutcome {
    pub fn chunks_written(&self) -> usize {
        match self {
            IndexOutcome::Indexed { chunks } => *chunks,
            IndexOutcome::Skipped { .. } => 0,
        }
    }
}

/// Drives one document through chunking, embedding and storage.
pub struct DocumentIndexer {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: MarkdownChunker,
}

impl DocumentIndexer {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: MarkdownChunker,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
        }
    }

    pub fn store(&self) -> &Arc<dyn IndexStore> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn chunker(&self) -> &MarkdownChunker {
        &self.chunker
    }

    /// Index one document. See module docs for the state machine.
    pub async fn index(
        &self,
        document_id: DocumentId,
        force_regenerate: bool,
    ) -> Result<IndexOutcome, IndexError> {
        let started = Instant::now();
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or(IndexError::NotFound(document_id))?;

        self.store
            .set_status(document_id, EmbeddingStatus::Processing)
            .await?;
        debug!(
            "Indexing document {} ({:?}), force={}",
            document_id, document.title, force_regenerate
        );

        match self
            .run(document_id, document.title, document.content, force_regenerate)
            .await
        {
            Ok(outcome) => {
                info!(
                    "Document {} done in {:?}: {:?}",
                    document_id,
                    started.elapsed(),
                    outcome
                );
                Ok(outcome)
            }
            Err(e) => {
                match &e {
                    IndexError::IntegrityViolation { expected, actual } => error!(
                        "Integrity violation for document {}: {} vectors for {} chunks",
                        document_id, actual, expected
                    ),
                    other => warn!("Indexing document {} failed: {}", document_id, other),
                }
                self.mark_failed(document_id).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        document_id: DocumentId,
        title: String,
        content: String,
        force_regenerate: bool,
    ) -> Result<IndexOutcome, IndexError> {
        if !force_regenerate {
            let existing_chunks = self.store.count_chunks(document_id).await?;
            if existing_chunks > 0 {
                self.store.mark_completed(document_id).await?;
                debug!(
                    "Document {} already has {} chunks, skipping",
                    document_id, existing_chunks
                );
                return Ok(IndexOutcome::Skipped { existing_chunks });
            }
        }

        let chunker = self.chunker.clone();
        let chunks = tokio::task::spawn_blocking(move || chunker.chunk(&title, &content))
            .await
            .map_err(|e| IndexError::Chunking(e.to_string()))?;

        if chunks.is_empty() {
            self.store.replace_chunks(document_id, Vec::new()).await?;
            return Ok(IndexOutcome::Indexed { chunks: 0 });
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.chunk_text.clone()).collect();
        let embedded = self.embedder.embed_batched(&texts, None, true).await?;
        if embedded.len() != chunks.len() {
            return Err(IndexError::IntegrityViolation {
                expected: chunks.len(),
                actual: embedded.len(),
            });
        }

        let rows: Vec<NewChunk> = chunks
            .into_iter()
            .zip(embedded.embeddings)
            .map(|(chunk, embedding)| to_row(chunk, embedding))
            .collect();
        let written = self.store.replace_chunks(document_id, rows).await?;
        Ok(IndexOutcome::Indexed { chunks: written })
    }

    /// Best-effort `failed` status write. A failure here is logged, not returned, so
    /// the original error reaches the caller.
    pub async fn mark_failed(&self, document_id: DocumentId) {
        if let Err(e) = self
            .store
            .set_status(document_id, EmbeddingStatus::Failed)
            .await
        {
            error!("Could not mark document {} as failed: {:#}", document_id, e);
        }
    }
}

fn to_row(chunk: TextChunk, embedding: Vec<half::f16>) -> NewChunk {
    NewChunk {
        chunk_index: chunk.chunk_index,
        chunk_text: chunk.chunk_text,
        heading_path: chunk.heading_path,
        token_count: chunk.token_count,
        embedding,
    }
}
