//! Storage abstraction layer for pagesearch-retriever
//!
//! The pipeline touches persisted state through three narrow traits, so the indexing
//! and search logic never depends on SQL:
//!
//! - **DocumentStore**: load a document, flip its embedding status, list by status
//! - **ChunkStore**: count, read and transactionally replace a document's chunks
//! - **SearchStore**: scoped vector scan and keyword match for the retrieval engine
//!
//! ## Architecture
//!
//! ```text
//! DocumentStore ─┐
//! ChunkStore ────┼─ IndexStore ── SqliteStore (concrete implementation)
//! SearchStore ───┘
//! ```
//!
//! Documents belong to the surrounding CRUD layer. The pipeline reads
//! title/content/summary/publication and writes only `embedding_status`,
//! `embedding_updated_at` and chunk rows. [`DocumentStore::upsert_document`] is the one
//! write path for producers that register documents.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod sqlite_store;

pub use sqlite_store::{IndexInfo, SqliteStore};

/// Stable identifier of a document, owned by the CRUD layer.
pub type DocumentId = i64;

/// Database ID for a stored chunk.
pub type ChunkId = i64;

/// Where a document is in the embedding lifecycle.
///
/// `pending → processing → completed | failed`. A forced regeneration moves a
/// `completed` or `failed` document back to `pending`/`processing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EmbeddingStatus {
    pub const ALL: [EmbeddingStatus; 4] = [
        EmbeddingStatus::Pending,
        EmbeddingStatus::Processing,
        EmbeddingStatus::Completed,
        EmbeddingStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbeddingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(EmbeddingStatus::Pending),
            "processing" => Ok(EmbeddingStatus::Processing),
            "completed" => Ok(EmbeddingStatus::Completed),
            "failed" => Ok(EmbeddingStatus::Failed),
            other => Err(anyhow::anyhow!("unknown embedding status: {other}")),
        }
    }
}

/// A document as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: DocumentId,
    /// Owning collection (wiki, space). Opaque to the pipeline.
    pub collection_id: i64,
    pub title: String,
    pub content: String,
    pub summary: Option<String>,
    pub is_published: bool,
    pub embedding_status: EmbeddingStatus,
    pub embedding_updated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Document fields without the content, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub collection_id: i64,
    pub title: String,
    pub embedding_status: EmbeddingStatus,
    pub embedding_updated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Producer-side document write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    /// `None` allocates a new id.
    #[serde(default)]
    pub id: Option<DocumentId>,
    #[serde(default)]
    pub collection_id: i64,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default = "default_published")]
    pub is_published: bool,
}

fn default_published() -> bool {
    true
}

impl DocumentInput {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            collection_id: 0,
            title: title.into(),
            content: content.into(),
            summary: None,
            is_published: true,
        }
    }

    pub fn with_id(self, id: DocumentId) -> Self {
        Self {
            id: Some(id),
            ..self
        }
    }

    pub fn with_summary(self, summary: impl Into<String>) -> Self {
        Self {
            summary: Some(summary.into()),
            ..self
        }
    }

    pub fn with_published(self, is_published: bool) -> Self {
        Self {
            is_published,
            ..self
        }
    }

    pub fn with_collection(self, collection_id: i64) -> Self {
        Self {
            collection_id,
            ..self
        }
    }
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub id: DocumentId,
    pub created: bool,
    /// Title or content differs from the stored version.
    pub content_changed: bool,
}

/// A chunk ready to be persisted together with its vector.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub chunk_index: usize,
    pub chunk_text: String,
    pub heading_path: String,
    pub token_count: usize,
    pub embedding: Vec<half::f16>,
}

/// A persisted chunk, without its vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub heading_path: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A chunk and its cosine distance to a query vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMatch {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub document_title: String,
    pub document_summary: Option<String>,
    pub collection_id: i64,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub heading_path: String,
    /// `1 - cos`, in `[0, 2]`.
    pub distance: f32,
}

/// A document whose title, content or summary contains the keyword.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordMatch {
    pub document_id: DocumentId,
    pub title: String,
    pub summary: Option<String>,
    pub collection_id: i64,
    pub title_match: bool,
}

/// Document operations. See module docs for the ownership rules.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>>;

    /// Insert or update a document. A change of title or content resets the status to
    /// `pending`.
    async fn upsert_document(&self, input: DocumentInput) -> Result<UpsertOutcome>;

    /// Persist a status immediately. Returns `false` if the document does not exist.
    async fn set_status(&self, id: DocumentId, status: EmbeddingStatus) -> Result<bool>;

    /// Set `completed` and stamp `embedding_updated_at` without touching chunks.
    async fn mark_completed(&self, id: DocumentId) -> Result<()>;

    /// Documents in any of `statuses`, most recently updated first.
    async fn list_by_status(&self, statuses: &[EmbeddingStatus]) -> Result<Vec<DocumentSummary>>;

    /// Number of documents per status. Statuses with no documents are absent.
    async fn status_counts(&self) -> Result<HashMap<EmbeddingStatus, usize>>;
}

/// Chunk operations
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn count_chunks(&self, document_id: DocumentId) -> Result<usize>;

    /// Chunks of one document ordered by `chunk_index`.
    async fn get_chunks(&self, document_id: DocumentId) -> Result<Vec<StoredChunk>>;

    /// In one transaction: delete the document's chunks, insert `chunks`, set the
    /// document `completed` and stamp `embedding_updated_at`.
    async fn replace_chunks(&self, document_id: DocumentId, chunks: Vec<NewChunk>) -> Result<usize>;

    async fn total_chunks(&self) -> Result<usize>;
}

/// Read-only queries behind the retrieval engine.
///
/// Both only consider published documents whose id is in `scope`.
#[async_trait]
pub trait SearchStore: Send + Sync {
    /// Every scoped chunk with its distance to `query`, nearest first.
    async fn nearest_chunks(&self, query: &[half::f16], scope: &[DocumentId]) -> Result<Vec<ChunkMatch>>;

    /// Case-insensitive substring match, title matches first, at most `limit` rows.
    async fn keyword_matches(
        &self,
        keyword: &str,
        scope: &[DocumentId],
        limit: usize,
    ) -> Result<Vec<KeywordMatch>>;
}

/// Everything the indexer and search engine need from one backend.
pub trait IndexStore: DocumentStore + ChunkStore + SearchStore {}

impl<T: DocumentStore + ChunkStore + SearchStore> IndexStore for T {}

/// Cosine distance `1 - cos(a, b)`, in `[0, 2]`. A zero vector is at distance 1.
pub fn cosine_distance(a: &[half::f16], b: &[half::f16]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let cos = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    1.0 - cos
}
