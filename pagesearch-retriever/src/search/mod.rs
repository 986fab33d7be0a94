//! Retrieval over indexed documents.
//!
//! - [`SearchEngine::semantic_search`]: chunk-level nearest neighbours of the query vector
//! - [`SearchEngine::keyword_search`]: substring match on title, content and summary
//! - [`SearchEngine::hybrid_search`]: both, fused per document by a weighted sum
//!
//! Every query is confined to the caller's accessible documents and to published ones.

pub mod engine;
pub mod fusion;

pub use engine::SearchEngine;

use crate::storage::{ChunkId, DocumentId};
use pagesearch_embed::EmbedError;
use serde::{Deserialize, Serialize};

/// Defaults and bounds for request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub default_limit: usize,
    pub max_limit: usize,
    pub default_threshold: f32,
    pub default_semantic_weight: f32,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_limit: 20,
            max_limit: 100,
            default_threshold: 0.5,
            default_semantic_weight: 0.7,
        }
    }
}

/// One search request. Unset parameters fall back to [`SearchSettings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Documents the caller may see. Nothing outside this set is ever ranked.
    pub accessible_document_ids: Vec<DocumentId>,
    /// Optional narrowing, must be a subset of the accessible documents
    #[serde(default)]
    pub scope: Option<Vec<DocumentId>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    /// Minimum similarity in `[0, 1]`, semantic search only
    #[serde(default)]
    pub threshold: Option<f32>,
    /// Weight of the semantic signal in `[0, 1]`, hybrid search only
    #[serde(default)]
    pub semantic_weight: Option<f32>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, accessible_document_ids: Vec<DocumentId>) -> Self {
        Self {
            query: query.into(),
            accessible_document_ids,
            scope: None,
            limit: None,
            offset: None,
            threshold: None,
            semantic_weight: None,
        }
    }

    pub fn with_scope(self, scope: Vec<DocumentId>) -> Self {
        Self {
            scope: Some(scope),
            ..self
        }
    }

    pub fn with_limit(self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    pub fn with_offset(self, offset: usize) -> Self {
        Self {
            offset: Some(offset),
            ..self
        }
    }

    pub fn with_threshold(self, threshold: f32) -> Self {
        Self {
            threshold: Some(threshold),
            ..self
        }
    }

    pub fn with_semantic_weight(self, semantic_weight: f32) -> Self {
        Self {
            semantic_weight: Some(semantic_weight),
            ..self
        }
    }
}

/// One chunk in a semantic result page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticHit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub document_title: String,
    pub collection_id: i64,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub heading_path: String,
    /// Cosine distance `1 - cos`, in `[0, 2]`
    pub distance: f32,
    /// `1 - distance / 2`, in `[0, 1]`
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticResults {
    pub query: String,
    pub hits: Vec<SemanticHit>,
    /// Distinct documents in this page
    pub page_documents: usize,
    /// Chunks above the threshold, across all pages
    pub total_chunks: usize,
    /// Distinct documents above the threshold, across all pages
    pub total_documents: usize,
    pub limit: usize,
    pub offset: usize,
    pub threshold: f32,
}

/// A keyword match. The score is 2 for a title match, 1 otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordHit {
    pub document_id: DocumentId,
    pub title: String,
    pub summary: Option<String>,
    pub collection_id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridHit {
    pub document_id: DocumentId,
    pub title: String,
    pub summary: Option<String>,
    pub collection_id: i64,
    pub keyword_score: f32,
    pub semantic_score: f32,
    pub combined_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridResults {
    pub query: String,
    pub hits: Vec<HybridHit>,
    /// Query embedding failed; only keyword matches were ranked
    pub semantic_degraded: bool,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
    pub limit: usize,
}

/// Errors a search request can end with.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Invalid request parameters; nothing was queried
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The scope names documents outside the accessible set
    #[error("documents not accessible: {0:?}")]
    NotAccessible(Vec<DocumentId>),

    /// The query could not be embedded
    #[error("embedding service unavailable: {0}")]
    ServiceUnavailable(#[source] EmbedError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}
