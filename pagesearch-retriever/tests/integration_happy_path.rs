//! Integration tests for the indexing pipeline
//!
//! These tests drive documents through chunking, embedding and storage:
//! - Indexing a structured document and finding it again
//! - Idempotent re-indexing and forced replacement
//! - Failure handling (vector count mismatch, embedding outage)
//! - Queue-driven indexing and bulk reindexing
//! - Resetting the index for a new embedding model

use anyhow::Result;
use async_trait::async_trait;
use pagesearch_context::{ChunkerConfig, MarkdownChunker, TokenizerAdapter};
use pagesearch_embed::{EmbedError, EmbeddingProvider, EmbeddingResult};
use pagesearch_retriever::retrieval::{
    indexer::{DocumentIndexer, IndexError, IndexOutcome},
    indexing_engine::{IndexingEngine, ReindexFilter},
    task_queue::{JobState, TaskQueueConfig},
};
use pagesearch_retriever::search::{SearchEngine, SearchRequest, SearchSettings};
use pagesearch_retriever::storage::{
    ChunkStore, DocumentInput, DocumentStore, EmbeddingStatus, SqliteStore,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tempfile::tempdir;
use tokio_test::{assert_err, assert_ok};

/// Embeds each text as `[1, words / 100]`; can drop the last vector or go down.
#[derive(Default)]
struct FakeEmbedder {
    short_by_one: AtomicBool,
    down: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(
        &self,
        texts: &[String],
        _normalize: bool,
    ) -> pagesearch_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(EmbedError::service_unavailable("connection refused"));
        }
        let mut vectors: Vec<Vec<f32>> = texts
            .iter()
            .map(|t| vec![1.0, t.split_whitespace().count() as f32 / 100.0])
            .collect();
        if self.short_by_one.load(Ordering::SeqCst) {
            vectors.pop();
        }
        Ok(EmbeddingResult::from_f32(vectors))
    }

    fn batch_size(&self) -> usize {
        32
    }

    fn embedding_dimension(&self) -> usize {
        2
    }

    fn provider_name(&self) -> &str {
        "fake"
    }
}

struct Fixture {
    store: Arc<SqliteStore>,
    embedder: Arc<FakeEmbedder>,
    indexer: DocumentIndexer,
    _dir: tempfile::TempDir,
}

async fn fixture(max_tokens: usize, overlap_tokens: usize) -> Result<Fixture> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::open(&dir.path().join("index.db")).await?);
    store.ensure_embedding_model("fake", 2).await?;
    let embedder = Arc::new(FakeEmbedder::default());
    let chunker = MarkdownChunker::new(
        ChunkerConfig::new(max_tokens, overlap_tokens),
        TokenizerAdapter::heuristic(),
    );
    let indexer = DocumentIndexer::new(store.clone(), embedder.clone(), chunker);
    Ok(Fixture {
        store,
        embedder,
        indexer,
        _dir: dir,
    })
}

fn paragraph(word: &str, words: usize) -> String {
    vec![word; words].join(" ") + "."
}

/// A document long enough to need several chunks at small budgets.
fn handbook() -> String {
    format!(
        "# Handbook\n\n{}\n\n## Deploys\n\n{}\n\n## Oncall\n\n{}\n\n### Escalation\n\n{}",
        paragraph("intro", 30),
        paragraph("deploy", 30),
        paragraph("pager", 30),
        paragraph("escalate", 30),
    )
}

#[tokio::test]
async fn test_index_structured_document() -> Result<()> {
    let f = fixture(40, 5).await?;
    let id = f.store.upsert_document(DocumentInput::new("Handbook", handbook())).await?.id;

    let outcome = f.indexer.index(id, false).await?;
    let IndexOutcome::Indexed { chunks } = outcome else {
        panic!("expected a fresh index, got {outcome:?}");
    };
    assert!(chunks >= 3);

    let stored = f.store.get_chunks(id).await?;
    assert_eq!(stored.len(), chunks);
    for (i, chunk) in stored.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i);
        assert!(chunk.token_count > 0);
    }
    assert!(stored[0].chunk_text.starts_with("# Handbook"));
    assert_eq!(stored[0].heading_path, "");
    assert!(stored[1..].iter().all(|c| c.heading_path.starts_with("Handbook")));
    assert!(stored.iter().any(|c| c.chunk_text.contains("deploy deploy")));

    let document = f.store.get_document(id).await?.unwrap();
    assert_eq!(document.embedding_status, EmbeddingStatus::Completed);
    assert!(document.embedding_updated_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_second_index_without_force_writes_nothing() -> Result<()> {
    let f = fixture(40, 5).await?;
    let id = f.store.upsert_document(DocumentInput::new("Handbook", handbook())).await?.id;

    assert_ok!(f.indexer.index(id, false).await);
    let before = f.store.get_chunks(id).await?;
    let calls = f.embedder.calls.load(Ordering::SeqCst);

    let outcome = f.indexer.index(id, false).await?;
    assert_eq!(
        outcome,
        IndexOutcome::Skipped {
            existing_chunks: before.len()
        }
    );
    assert_eq!(f.embedder.calls.load(Ordering::SeqCst), calls);
    assert_eq!(f.store.get_chunks(id).await?, before);
    Ok(())
}

#[tokio::test]
async fn test_force_replaces_chunk_set() -> Result<()> {
    let f = fixture(40, 5).await?;
    let id = f.store.upsert_document(DocumentInput::new("Handbook", handbook())).await?.id;
    f.indexer.index(id, false).await?;
    let old_ids: Vec<_> = f.store.get_chunks(id).await?.iter().map(|c| c.id).collect();

    let outcome = f
        .store
        .upsert_document(DocumentInput::new("Handbook", "Only this now.").with_id(id))
        .await?;
    assert!(outcome.content_changed);
    assert_eq!(f.indexer.index(id, true).await?, IndexOutcome::Indexed { chunks: 1 });

    let stored = f.store.get_chunks(id).await?;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].chunk_text, "# Handbook\n\nOnly this now.");
    assert!(stored.iter().all(|c| !old_ids.contains(&c.id)));
    Ok(())
}

#[tokio::test]
async fn test_vector_count_mismatch_fails_document() -> Result<()> {
    let f = fixture(40, 5).await?;
    let id = f.store.upsert_document(DocumentInput::new("Handbook", handbook())).await?.id;
    f.embedder.short_by_one.store(true, Ordering::SeqCst);

    let err = assert_err!(f.indexer.index(id, false).await);
    let IndexError::IntegrityViolation { expected, actual } = err else {
        panic!("expected an integrity violation, got {err:?}");
    };
    assert_eq!(actual + 1, expected);

    assert_eq!(f.store.count_chunks(id).await?, 0);
    let document = f.store.get_document(id).await?.unwrap();
    assert_eq!(document.embedding_status, EmbeddingStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_outage_keeps_previous_chunks() -> Result<()> {
    let f = fixture(256, 50).await?;
    let id = f
        .store
        .upsert_document(DocumentInput::new("Runbook", "Restart the service."))
        .await?
        .id;
    f.indexer.index(id, false).await?;
    let before = f.store.get_chunks(id).await?;

    f.embedder.down.store(true, Ordering::SeqCst);
    let err = assert_err!(f.indexer.index(id, true).await);
    assert!(matches!(err, IndexError::Embedding(ref e) if e.is_unavailable()));

    assert_eq!(f.store.get_chunks(id).await?, before);
    let document = f.store.get_document(id).await?.unwrap();
    assert_eq!(document.embedding_status, EmbeddingStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_missing_document() -> Result<()> {
    let f = fixture(256, 50).await?;
    let err = assert_err!(f.indexer.index(404, false).await);
    assert!(matches!(err, IndexError::NotFound(404)));
    assert_eq!(f.embedder.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_queue_indexes_and_reindexes_failures() -> Result<()> {
    let f = fixture(256, 50).await?;
    let embedder = f.embedder.clone();
    let store = f.store.clone();
    let engine = IndexingEngine::new(
        f.indexer,
        TaskQueueConfig {
            max_workers: 2,
            ..TaskQueueConfig::default()
        },
    );
    engine.start().await;

    embedder.down.store(true, Ordering::SeqCst);
    let mut jobs = Vec::new();
    for i in 0..3 {
        let report = engine
            .put_document(DocumentInput::new(format!("Page {i}"), format!("Body {i}.")))
            .await?;
        jobs.push(report.job_id.unwrap());
    }
    engine.wait_idle().await;

    for job in &jobs {
        let record = engine.job_status(*job).await.unwrap();
        assert!(matches!(record.state, JobState::Failed { .. }));
    }
    let failed = store.list_by_status(&[EmbeddingStatus::Failed]).await?;
    assert_eq!(failed.len(), 3);

    embedder.down.store(false, Ordering::SeqCst);
    let report = engine.reindex_all(ReindexFilter::Failed).await?;
    assert_eq!(report.enqueued, 3);
    assert_eq!(report.failed, 0);
    engine.wait_idle().await;

    let counts = store.status_counts().await?;
    assert_eq!(counts.get(&EmbeddingStatus::Completed), Some(&3));
    assert_eq!(store.total_chunks().await?, 3);
    let stats = engine.stats().await;
    assert_eq!(stats.documents_failed, 3);
    assert_eq!(stats.documents_indexed, 3);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_reset_embeddings_for_new_model() -> Result<()> {
    let f = fixture(256, 50).await?;
    let id = f
        .store
        .upsert_document(DocumentInput::new("Runbook", "Restart the service."))
        .await?
        .id;
    f.indexer.index(id, false).await?;

    let err = assert_err!(f.store.ensure_embedding_model("bigger", 768).await);
    assert!(err.to_string().contains("reset-embeddings"));

    let deleted = f.store.reset_embeddings("bigger", 768).await?;
    assert_eq!(deleted, 1);
    assert_ok!(f.store.ensure_embedding_model("bigger", 768).await);
    let document = f.store.get_document(id).await?.unwrap();
    assert_eq!(document.embedding_status, EmbeddingStatus::Pending);
    assert_eq!(document.embedding_updated_at, None);
    Ok(())
}

#[tokio::test]
async fn test_indexed_document_is_searchable() -> Result<()> {
    let f = fixture(256, 50).await?;
    let id = f
        .store
        .upsert_document(DocumentInput::new("Runbook", "Restart the service."))
        .await?
        .id;
    f.indexer.index(id, false).await?;

    let search = SearchEngine::new(f.store.clone(), f.embedder.clone(), SearchSettings::default());
    let results = search
        .semantic_search(&SearchRequest::new("restart", vec![id]))
        .await?;
    assert_eq!(results.total_chunks, 1);
    assert_eq!(results.hits[0].document_title, "Runbook");
    assert!(results.hits[0].similarity > 0.99);
    Ok(())
}
