// Weighted score fusion for hybrid search

use crate::storage::DocumentId;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Keyword score of a document whose title contains the query.
pub const TITLE_MATCH_SCORE: f32 = 2.0;

/// Keyword score of a document that only matches in content or summary.
pub const BODY_MATCH_SCORE: f32 = 1.0;

pub fn keyword_score(title_match: bool) -> f32 {
    if title_match {
        TITLE_MATCH_SCORE
    } else {
        BODY_MATCH_SCORE
    }
}

/// Map a cosine distance in `[0, 2]` onto a similarity in `[0, 1]`.
pub fn similarity(distance: f32) -> f32 {
    1.0 - distance / 2.0
}

/// Both signals and their weighted sum for one document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusedScore {
    pub document_id: DocumentId,
    pub keyword_score: f32,
    pub semantic_score: f32,
    pub combined_score: f32,
}

/// Combine per-document keyword and semantic scores.
///
/// `combined = keyword * (1 - w) + semantic * w`. A document missing from one list
/// scores 0 for that signal; a document listed twice keeps its best score.
/// Results are sorted by combined score descending, ties by document id ascending.
pub fn weighted_fusion(
    keyword: &[(DocumentId, f32)],
    semantic: &[(DocumentId, f32)],
    semantic_weight: f32,
) -> Vec<FusedScore> {
    let keyword_weight = 1.0 - semantic_weight;

    let mut scores: HashMap<DocumentId, (f32, f32)> = HashMap::new();
    for &(id, score) in keyword {
        let entry = scores.entry(id).or_insert((0.0, 0.0));
        entry.0 = entry.0.max(score);
    }
    for &(id, score) in semantic {
        let entry = scores.entry(id).or_insert((0.0, 0.0));
        entry.1 = entry.1.max(score);
    }

    let mut fused: Vec<FusedScore> = scores
        .into_iter()
        .map(|(document_id, (keyword_score, semantic_score))| FusedScore {
            document_id,
            keyword_score,
            semantic_score,
            combined_score: keyword_score * keyword_weight + semantic_score * semantic_weight,
        })
        .collect();

    fused.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(Ordering::Equal)
            .then(a.document_id.cmp(&b.document_id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(fused: &[FusedScore]) -> Vec<DocumentId> {
        fused.iter().map(|f| f.document_id).collect()
    }

    #[test]
    fn test_weight_law() {
        let fused = weighted_fusion(&[(1, 2.0)], &[(1, 0.8)], 0.7);
        let expected = 2.0 * 0.3 + 0.8 * 0.7;
        assert!((fused[0].combined_score - expected).abs() < 1e-5);
        assert_eq!(fused[0].keyword_score, 2.0);
        assert_eq!(fused[0].semantic_score, 0.8);
    }

    #[test]
    fn test_missing_signal_counts_as_zero() {
        let fused = weighted_fusion(&[(1, 1.0)], &[(2, 0.9)], 0.5);
        assert_eq!(ids(&fused), vec![1, 2]);
        assert_eq!(fused[0].semantic_score, 0.0);
        assert_eq!(fused[1].keyword_score, 0.0);
        assert!((fused[1].combined_score - 0.45).abs() < 1e-6);
    }

    #[test]
    fn test_extreme_weights() {
        let keyword = [(1, 1.0), (2, 2.0)];
        let semantic = [(1, 0.9), (2, 0.1)];
        assert_eq!(ids(&weighted_fusion(&keyword, &semantic, 0.0)), vec![2, 1]);
        assert_eq!(ids(&weighted_fusion(&keyword, &semantic, 1.0)), vec![1, 2]);
    }

    #[test]
    fn test_ties_break_by_id() {
        let fused = weighted_fusion(&[(9, 1.0), (3, 1.0), (5, 1.0)], &[], 0.7);
        assert_eq!(ids(&fused), vec![3, 5, 9]);
    }

    #[test]
    fn test_duplicates_keep_best() {
        let fused = weighted_fusion(&[], &[(4, 0.2), (4, 0.6)], 1.0);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].semantic_score, 0.6);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(weighted_fusion(&[], &[], 0.7).is_empty());
    }

    #[test]
    fn test_similarity_mapping() {
        assert_eq!(similarity(0.0), 1.0);
        assert_eq!(similarity(1.0), 0.5);
        assert_eq!(similarity(2.0), 0.0);
        assert_eq!(keyword_score(true), 2.0);
        assert_eq!(keyword_score(false), 1.0);
    }
}
