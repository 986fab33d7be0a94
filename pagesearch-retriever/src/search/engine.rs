use super::fusion::{self, FusedScore};
use super::{
    HybridHit, HybridResults, KeywordHit, SearchError, SearchRequest, SearchSettings, SemanticHit,
    SemanticResults,
};
use crate::storage::{ChunkMatch, DocumentId, IndexStore, KeywordMatch, SearchStore};
use pagesearch_embed::EmbeddingProvider;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Validated request parameters.
#[derive(Debug)]
struct Params {
    query: String,
    scope: Vec<DocumentId>,
    limit: usize,
    offset: usize,
    threshold: f32,
    semantic_weight: f32,
}

/// Read-only search over an [`IndexStore`].
///
/// Holds no mutable state: every parameter arrives with the request, so any number of
/// searches may run concurrently.
pub struct SearchEngine {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    settings: SearchSettings,
}

impl SearchEngine {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &SearchSettings {
        &self.settings
    }

    /// Chunk-level semantic search.
    ///
    /// Chunks whose similarity is below the threshold are dropped; the rest are
    /// ordered nearest first and paginated. An unreachable embedding service is
    /// [`SearchError::ServiceUnavailable`].
    pub async fn semantic_search(&self, request: &SearchRequest) -> Result<SemanticResults, SearchError> {
        let params = self.validate(request)?;
        let started = Instant::now();

        let mut results = SemanticResults {
            query: params.query.clone(),
            hits: Vec::new(),
            page_documents: 0,
            total_chunks: 0,
            total_documents: 0,
            limit: params.limit,
            offset: params.offset,
            threshold: params.threshold,
        };
        if params.scope.is_empty() {
            return Ok(results);
        }

        let matches = self.nearest(&params).await?;
        let matching: Vec<ChunkMatch> = matches
            .into_iter()
            .filter(|m| fusion::similarity(m.distance) >= params.threshold)
            .collect();

        results.total_chunks = matching.len();
        results.total_documents = distinct_documents(matching.iter().map(|m| m.document_id));
        results.hits = matching
            .into_iter()
            .skip(params.offset)
            .take(params.limit)
            .map(semantic_hit)
            .collect();
        results.page_documents = distinct_documents(results.hits.iter().map(|h| h.document_id));

        info!(
            "Semantic search {:?}: {} of {} chunks in {:?}",
            params.query,
            results.hits.len(),
            results.total_chunks,
            started.elapsed()
        );
        Ok(results)
    }

    /// Substring search on title, content and summary. Title matches come first.
    pub async fn keyword_search(&self, request: &SearchRequest) -> Result<Vec<KeywordHit>, SearchError> {
        let params = self.validate(request)?;
        if params.scope.is_empty() {
            return Ok(Vec::new());
        }

        let matches = self
            .store
            .keyword_matches(
                &params.query,
                &params.scope,
                params.offset.saturating_add(params.limit),
            )
            .await?;
        Ok(matches
            .into_iter()
            .skip(params.offset)
            .map(|m| KeywordHit {
                score: fusion::keyword_score(m.title_match),
                document_id: m.document_id,
                title: m.title,
                summary: m.summary,
                collection_id: m.collection_id,
            })
            .collect())
    }

    /// Document-level search fusing keyword and semantic scores.
    ///
    /// Each side contributes its top `limit * 2` documents. If the query cannot be
    /// embedded the keyword side is returned alone and flagged `semantic_degraded`.
    pub async fn hybrid_search(&self, request: &SearchRequest) -> Result<HybridResults, SearchError> {
        let params = self.validate(request)?;
        let started = Instant::now();

        let mut results = HybridResults {
            query: params.query.clone(),
            hits: Vec::new(),
            semantic_degraded: false,
            semantic_weight: params.semantic_weight,
            keyword_weight: 1.0 - params.semantic_weight,
            limit: params.limit,
        };
        if params.scope.is_empty() {
            return Ok(results);
        }

        let candidates = params.limit * 2;
        let (keyword, semantic) = tokio::join!(
            self.store
                .keyword_matches(&params.query, &params.scope, candidates),
            self.semantic_candidates(&params, candidates),
        );
        let keyword = keyword?;
        let semantic = match semantic {
            Ok(semantic) => semantic,
            Err(SearchError::ServiceUnavailable(e)) => {
                warn!("Semantic side of hybrid search failed, using keywords only: {}", e);
                results.semantic_degraded = true;
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let mut documents: HashMap<DocumentId, DocumentFields> = HashMap::new();
        let keyword_scores: Vec<(DocumentId, f32)> = keyword
            .into_iter()
            .map(|m| {
                let score = fusion::keyword_score(m.title_match);
                let id = m.document_id;
                documents.insert(id, DocumentFields::from(m));
                (id, score)
            })
            .collect();
        let semantic_scores: Vec<(DocumentId, f32)> = semantic
            .into_iter()
            .map(|(m, score)| {
                let id = m.document_id;
                documents.entry(id).or_insert_with(|| DocumentFields::from(m));
                (id, score)
            })
            .collect();

        let fused = fusion::weighted_fusion(&keyword_scores, &semantic_scores, params.semantic_weight);
        results.hits = fused
            .into_iter()
            .take(params.limit)
            .filter_map(|score| {
                documents
                    .remove(&score.document_id)
                    .map(|fields| hybrid_hit(score, fields))
            })
            .collect();

        info!(
            "Hybrid search {:?}: {} results ({} keyword, {} semantic candidates{}) in {:?}",
            params.query,
            results.hits.len(),
            keyword_scores.len(),
            semantic_scores.len(),
            if results.semantic_degraded { ", degraded" } else { "" },
            started.elapsed()
        );
        Ok(results)
    }

    /// Top `count` documents by their best chunk similarity, without a threshold.
    async fn semantic_candidates(
        &self,
        params: &Params,
        count: usize,
    ) -> Result<Vec<(ChunkMatch, f32)>, SearchError> {
        let matches = self.nearest(params).await?;
        let mut seen = HashSet::new();
        // Nearest first, so the first chunk seen per document is its best.
        Ok(matches
            .into_iter()
            .filter(|m| seen.insert(m.document_id))
            .take(count)
            .map(|m| {
                let score = fusion::similarity(m.distance);
                (m, score)
            })
            .collect())
    }

    async fn nearest(&self, params: &Params) -> Result<Vec<ChunkMatch>, SearchError> {
        let started = Instant::now();
        let query = self
            .embedder
            .embed_text(&params.query, true)
            .await
            .map_err(SearchError::ServiceUnavailable)?;
        debug!("Embedded query in {:?}", started.elapsed());

        Ok(self.store.nearest_chunks(&query, &params.scope).await?)
    }

    fn validate(&self, request: &SearchRequest) -> Result<Params, SearchError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::BadRequest("search query required".to_string()));
        }

        let threshold = request.threshold.unwrap_or(self.settings.default_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SearchError::BadRequest(format!(
                "threshold must be between 0 and 1, got {threshold}"
            )));
        }
        let semantic_weight = request
            .semantic_weight
            .unwrap_or(self.settings.default_semantic_weight);
        if !(0.0..=1.0).contains(&semantic_weight) {
            return Err(SearchError::BadRequest(format!(
                "semantic_weight must be between 0 and 1, got {semantic_weight}"
            )));
        }

        let limit = request
            .limit
            .unwrap_or(self.settings.default_limit)
            .clamp(1, self.settings.max_limit.max(1));

        Ok(Params {
            query: query.to_string(),
            scope: resolve_scope(&request.accessible_document_ids, request.scope.as_deref())?,
            limit,
            offset: request.offset.unwrap_or(0),
            threshold,
            semantic_weight,
        })
    }
}

/// Intersect the optional scope with the accessible set, rejecting any outsider.
fn resolve_scope(
    accessible: &[DocumentId],
    scope: Option<&[DocumentId]>,
) -> Result<Vec<DocumentId>, SearchError> {
    let accessible: BTreeSet<DocumentId> = accessible.iter().copied().collect();
    let Some(scope) = scope else {
        return Ok(accessible.into_iter().collect());
    };
    if accessible.is_empty() {
        return Ok(Vec::new());
    }

    let scope: BTreeSet<DocumentId> = scope.iter().copied().collect();
    let outside: Vec<DocumentId> = scope.difference(&accessible).copied().collect();
    if !outside.is_empty() {
        return Err(SearchError::NotAccessible(outside));
    }
    Ok(scope.into_iter().collect())
}

fn distinct_documents(ids: impl Iterator<Item = DocumentId>) -> usize {
    ids.collect::<HashSet<_>>().len()
}

fn semantic_hit(m: ChunkMatch) -> SemanticHit {
    SemanticHit {
        similarity: fusion::similarity(m.distance),
        chunk_id: m.chunk_id,
        document_id: m.document_id,
        document_title: m.document_title,
        collection_id: m.collection_id,
        chunk_index: m.chunk_index,
        chunk_text: m.chunk_text,
        heading_path: m.heading_path,
        distance: m.distance,
    }
}

/// Display fields of a hybrid result, from whichever side found the document first.
struct DocumentFields {
    title: String,
    summary: Option<String>,
    collection_id: i64,
}

impl From<KeywordMatch> for DocumentFields {
    fn from(m: KeywordMatch) -> Self {
        Self {
            title: m.title,
            summary: m.summary,
            collection_id: m.collection_id,
        }
    }
}

impl From<ChunkMatch> for DocumentFields {
    fn from(m: ChunkMatch) -> Self {
        Self {
            title: m.document_title,
            summary: m.document_summary,
            collection_id: m.collection_id,
        }
    }
}

fn hybrid_hit(score: FusedScore, fields: DocumentFields) -> HybridHit {
    HybridHit {
        document_id: score.document_id,
        title: fields.title,
        summary: fields.summary,
        collection_id: fields.collection_id,
        keyword_score: score.keyword_score,
        semantic_score: score.semantic_score,
        combined_score: score.combined_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ChunkStore, DocumentInput, DocumentStore, NewChunk, SqliteStore};
    use async_trait::async_trait;
    use half::f16;
    use pagesearch_embed::{EmbedError, EmbeddingResult};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds every query as the same fixed vector, or fails.
    struct FixedQuery {
        vector: Option<Vec<f32>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedQuery {
        async fn embed(
            &self,
            _texts: &[String],
            _normalize: bool,
        ) -> pagesearch_embed::Result<EmbeddingResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.vector {
                Some(v) => Ok(EmbeddingResult::from_f32(vec![v.clone()])),
                None => Err(EmbedError::service_unavailable("connection failed")),
            }
        }

        fn batch_size(&self) -> usize {
            1
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "fixed"
        }
    }

    fn chunk(index: usize, embedding: [f32; 2]) -> NewChunk {
        NewChunk {
            chunk_index: index,
            chunk_text: format!("chunk {index}"),
            heading_path: String::new(),
            token_count: 2,
            embedding: embedding.iter().copied().map(f16::from_f32).collect(),
        }
    }

    async fn engine(query: Option<Vec<f32>>) -> (Arc<SqliteStore>, Arc<FixedQuery>, SearchEngine) {
        let store = Arc::new(SqliteStore::open_memory().await.unwrap());
        let embedder = Arc::new(FixedQuery {
            vector: query,
            calls: AtomicUsize::new(0),
        });
        let engine = SearchEngine::new(store.clone(), embedder.clone(), SearchSettings::default());
        (store, embedder, engine)
    }

    #[tokio::test]
    async fn test_blank_query_is_bad_request() {
        let (_, embedder, engine) = engine(Some(vec![1.0, 0.0])).await;
        let err = engine
            .semantic_search(&SearchRequest::new("   ", vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::BadRequest(_)));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parameter_bounds() {
        let (_, _, engine) = engine(Some(vec![1.0, 0.0])).await;
        let request = SearchRequest::new("q", vec![1]).with_threshold(1.5);
        assert!(matches!(
            engine.semantic_search(&request).await,
            Err(SearchError::BadRequest(_))
        ));
        let request = SearchRequest::new("q", vec![1]).with_semantic_weight(-0.1);
        assert!(matches!(
            engine.hybrid_search(&request).await,
            Err(SearchError::BadRequest(_))
        ));

        let params = engine
            .validate(&SearchRequest::new("q", vec![1]).with_limit(1000))
            .unwrap();
        assert_eq!(params.limit, 100);
        let params = engine
            .validate(&SearchRequest::new("q", vec![1]).with_limit(0))
            .unwrap();
        assert_eq!(params.limit, 1);
        let params = engine.validate(&SearchRequest::new(" q ", vec![1])).unwrap();
        assert_eq!((params.query.as_str(), params.limit, params.offset), ("q", 20, 0));
        assert_eq!(params.threshold, 0.5);
        assert_eq!(params.semantic_weight, 0.7);
    }

    #[tokio::test]
    async fn test_scope_outside_accessible_set() {
        let (_, _, engine) = engine(Some(vec![1.0, 0.0])).await;
        let request = SearchRequest::new("q", vec![1, 2]).with_scope(vec![2, 3]);
        match engine.semantic_search(&request).await {
            Err(SearchError::NotAccessible(ids)) => assert_eq!(ids, vec![3]),
            other => panic!("expected NotAccessible, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_accessible_set_is_empty_result() {
        let (_, embedder, engine) = engine(Some(vec![1.0, 0.0])).await;
        let results = engine
            .semantic_search(&SearchRequest::new("q", vec![]))
            .await
            .unwrap();
        assert!(results.hits.is_empty());
        let results = engine
            .hybrid_search(&SearchRequest::new("q", vec![]).with_scope(vec![5]))
            .await
            .unwrap();
        assert!(results.hits.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_threshold_filters_everything() {
        let (store, _, engine) = engine(Some(vec![1.0, 0.0])).await;
        let id = store.upsert_document(DocumentInput::new("T", "x")).await.unwrap().id;
        // Orthogonal to the query: distance 1, similarity 0.5.
        store.replace_chunks(id, vec![chunk(0, [0.0, 1.0])]).await.unwrap();

        let results = engine
            .semantic_search(&SearchRequest::new("q", vec![id]).with_threshold(0.9))
            .await
            .unwrap();
        assert!(results.hits.is_empty());
        assert_eq!(results.total_chunks, 0);

        let results = engine
            .semantic_search(&SearchRequest::new("q", vec![id]).with_threshold(0.5))
            .await
            .unwrap();
        assert_eq!(results.hits.len(), 1);
        assert!((results.hits[0].similarity - 0.5).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_semantic_pagination_and_counts() {
        let (store, _, engine) = engine(Some(vec![1.0, 0.0])).await;
        let a = store.upsert_document(DocumentInput::new("A", "x")).await.unwrap().id;
        let b = store.upsert_document(DocumentInput::new("B", "x")).await.unwrap().id;
        store
            .replace_chunks(a, vec![chunk(0, [1.0, 0.0]), chunk(1, [1.0, 0.2])])
            .await
            .unwrap();
        store
            .replace_chunks(b, vec![chunk(0, [1.0, 0.1]), chunk(1, [-1.0, 0.0])])
            .await
            .unwrap();

        let request = SearchRequest::new("q", vec![a, b]).with_limit(2).with_offset(1);
        let results = engine.semantic_search(&request).await.unwrap();
        assert_eq!(results.total_chunks, 3);
        assert_eq!(results.total_documents, 2);
        let order: Vec<_> = results.hits.iter().map(|h| (h.document_id, h.chunk_index)).collect();
        assert_eq!(order, vec![(b, 0), (a, 1)]);
        assert_eq!(results.page_documents, 2);
    }

    #[tokio::test]
    async fn test_semantic_failure_is_service_unavailable() {
        let (store, _, engine) = engine(None).await;
        let id = store.upsert_document(DocumentInput::new("T", "x")).await.unwrap().id;
        let err = engine
            .semantic_search(&SearchRequest::new("q", vec![id]))
            .await
            .unwrap_err();
        assert!(matches!(err, SearchError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_hybrid_degrades_to_keywords() {
        let (store, _, engine) = engine(None).await;
        let body = store
            .upsert_document(DocumentInput::new("Notes", "the rust borrow checker"))
            .await
            .unwrap()
            .id;
        let title = store
            .upsert_document(DocumentInput::new("Rust guide", "intro"))
            .await
            .unwrap()
            .id;

        let results = engine
            .hybrid_search(&SearchRequest::new("rust", vec![body, title]))
            .await
            .unwrap();
        assert!(results.semantic_degraded);
        let ids: Vec<_> = results.hits.iter().map(|h| h.document_id).collect();
        assert_eq!(ids, vec![title, body]);
        assert!((results.hits[0].combined_score - 2.0 * 0.3).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hybrid_fuses_both_sides() {
        let (store, _, engine) = engine(Some(vec![1.0, 0.0])).await;
        let keyword_only = store
            .upsert_document(DocumentInput::new("Deploy", "steps"))
            .await
            .unwrap()
            .id;
        let semantic_only = store
            .upsert_document(DocumentInput::new("Shipping", "release process").with_summary("how"))
            .await
            .unwrap()
            .id;
        store
            .replace_chunks(semantic_only, vec![chunk(0, [1.0, 0.0]), chunk(1, [0.0, 1.0])])
            .await
            .unwrap();

        let request = SearchRequest::new("deploy", vec![keyword_only, semantic_only])
            .with_semantic_weight(0.7);
        let results = engine.hybrid_search(&request).await.unwrap();
        assert!(!results.semantic_degraded);
        assert_eq!(results.hits.len(), 2);

        // Keyword: 2 * 0.3 = 0.6. Semantic: best chunk similarity 1.0 * 0.7 = 0.7.
        assert_eq!(results.hits[0].document_id, semantic_only);
        assert!((results.hits[0].semantic_score - 1.0).abs() < 1e-3);
        assert_eq!(results.hits[0].summary.as_deref(), Some("how"));
        assert_eq!(results.hits[1].document_id, keyword_only);
        assert_eq!(results.hits[1].semantic_score, 0.0);
    }

    #[tokio::test]
    async fn test_keyword_search_scores() {
        let (store, _, engine) = engine(None).await;
        let a = store
            .upsert_document(DocumentInput::new("Alpha", "mentions beta"))
            .await
            .unwrap()
            .id;
        let b = store
            .upsert_document(DocumentInput::new("Beta", "text"))
            .await
            .unwrap()
            .id;

        let hits = engine
            .keyword_search(&SearchRequest::new("beta", vec![a, b]))
            .await
            .unwrap();
        let scored: Vec<_> = hits.iter().map(|h| (h.document_id, h.score)).collect();
        assert_eq!(scored, vec![(b, 2.0), (a, 1.0)]);
    }

    #[tokio::test]
    async fn test_huge_offset_is_an_empty_page() {
        let (store, _, engine) = engine(Some(vec![1.0, 0.0])).await;
        let id = store
            .upsert_document(DocumentInput::new("Alpha", "alpha text"))
            .await
            .unwrap()
            .id;
        store.replace_chunks(id, vec![chunk(0, [1.0, 0.0])]).await.unwrap();

        let request = SearchRequest::new("alpha", vec![id]).with_offset(usize::MAX);
        assert!(engine.keyword_search(&request).await.unwrap().is_empty());

        let results = engine.semantic_search(&request.clone().with_threshold(0.0)).await.unwrap();
        assert!(results.hits.is_empty());
        assert_eq!(results.total_chunks, 1);
    }
}
