//! Exact in-memory nearest-neighbour index over passage vectors.
//!
//! One [`VectorIndex`] is built per document and frozen afterwards; it is
//! then shared read-only between concurrently answered questions.
//!
//! # Ranking
//!
//! `query` scans every entry with the index's score function (cosine
//! similarity unless overridden), then orders hits:
//!
//! 1. by score, descending;
//! 2. scores within [`TIE_TOLERANCE`] of each other count as tied and are
//!    ordered by ascending passage index, so the earlier passage wins.
//!
//! At the scale of a single policy document (tens to low thousands of
//! passages) the linear scan is cheaper than building any tree.

use crate::embedding::cosine_similarity;
use crate::error::{QaError, QaResult};

/// Scores closer than this are ranked by passage index instead.
pub const TIE_TOLERANCE: f32 = 1e-6;

/// Similarity function: higher is more similar, range `[-1, 1]`.
pub type ScoreFn = fn(&[f32], &[f32]) -> f32;

/// A passage index paired with its embedding.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub passage_index: usize,
    pub vector: Vec<f32>,
}

/// One ranked entry returned by [`VectorIndex::query`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexHit {
    pub passage_index: usize,
    pub score: f32,
}

#[derive(Clone)]
pub struct VectorIndex {
    entries: Vec<IndexEntry>,
    dims: Option<usize>,
    score_fn: ScoreFn,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("entries", &self.entries.len())
            .field("dims", &self.dims)
            .finish()
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex {
    /// An empty index scored by cosine similarity.
    pub fn new() -> Self {
        Self::with_score_fn(cosine_similarity)
    }

    pub fn with_score_fn(score_fn: ScoreFn) -> Self {
        Self {
            entries: Vec::new(),
            dims: None,
            score_fn,
        }
    }

    /// Replace the index contents with `entries`.
    ///
    /// Fails with [`QaError::DimensionMismatch`] if the vectors disagree on
    /// length; the previous contents are kept in that case.
    pub fn build(&mut self, entries: Vec<IndexEntry>) -> QaResult<()> {
        let dims = entries.first().map(|e| e.vector.len());
        if let Some(expected) = dims {
            if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
                return Err(QaError::DimensionMismatch {
                    expected,
                    actual: bad.vector.len(),
                });
            }
        }
        self.entries = entries;
        self.dims = dims;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vector length shared by all entries, `None` while empty.
    pub fn dims(&self) -> Option<usize> {
        self.dims
    }

    /// Return up to `k` entries ranked by similarity to `vector`.
    ///
    /// # Errors
    ///
    /// - [`QaError::InvalidArgument`] if `k <= 0`.
    /// - [`QaError::DimensionMismatch`] if `vector` has the wrong length
    ///   for a non-empty index.
    pub fn query(&self, vector: &[f32], k: i64) -> QaResult<Vec<IndexHit>> {
        if k <= 0 {
            return Err(QaError::invalid(format!("k must be >= 1, got {}", k)));
        }
        let Some(dims) = self.dims else {
            return Ok(Vec::new());
        };
        if vector.len() != dims {
            return Err(QaError::DimensionMismatch {
                expected: dims,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<IndexHit> = self
            .entries
            .iter()
            .map(|entry| {
                let score = (self.score_fn)(vector, &entry.vector);
                IndexHit {
                    passage_index: entry.passage_index,
                    // NaN would poison the ordering; rank it last.
                    score: if score.is_nan() { -1.0 } else { score.clamp(-1.0, 1.0) },
                }
            })
            .collect();

        rank(&mut hits);
        hits.truncate(usize::try_from(k).unwrap_or(usize::MAX));
        Ok(hits)
    }
}

/// Sort by score descending, then reorder runs of near-equal scores by
/// ascending passage index.
fn rank(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.passage_index.cmp(&b.passage_index))
    });

    let mut start = 0;
    while start < hits.len() {
        let head = hits[start].score;
        let mut end = start + 1;
        while end < hits.len() && (head - hits[end].score).abs() <= TIE_TOLERANCE {
            end += 1;
        }
        hits[start..end].sort_by_key(|h| h.passage_index);
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(passage_index: usize, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            passage_index,
            vector,
        }
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new();
        index
            .build(vec![
                entry(0, vec![1.0, 0.0, 0.0]),
                entry(1, vec![0.0, 1.0, 0.0]),
                entry(2, vec![0.7, 0.7, 0.0]),
                entry(3, vec![0.0, 0.0, 1.0]),
            ])
            .unwrap();
        index
    }

    #[test]
    fn test_query_ranks_by_similarity() {
        let index = sample_index();
        let hits = index.query(&[1.0, 0.1, 0.0], 3).unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].passage_index, 0);
        assert_eq!(hits[1].passage_index, 2);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_query_never_exceeds_k() {
        let index = sample_index();
        assert_eq!(index.query(&[1.0, 0.0, 0.0], 1).unwrap().len(), 1);
        assert_eq!(index.query(&[1.0, 0.0, 0.0], 100).unwrap().len(), 4);
    }

    #[test]
    fn test_ties_broken_by_ascending_index() {
        let mut index = VectorIndex::new();
        index
            .build(vec![
                entry(5, vec![1.0, 0.0]),
                entry(2, vec![1.0, 0.0]),
                entry(9, vec![0.0, 1.0]),
                entry(0, vec![1.0, 0.0]),
            ])
            .unwrap();
        let hits = index.query(&[1.0, 0.0], 4).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.passage_index).collect();
        assert_eq!(order, vec![0, 2, 5, 9]);
    }

    #[test]
    fn test_near_ties_within_tolerance() {
        let mut index = VectorIndex::with_score_fn(|_, v| v[0]);
        index
            .build(vec![
                entry(3, vec![0.5000004]),
                entry(1, vec![0.5]),
                entry(2, vec![0.4]),
            ])
            .unwrap();
        let hits = index.query(&[0.0], 3).unwrap();
        let order: Vec<usize> = hits.iter().map(|h| h.passage_index).collect();
        assert_eq!(order, vec![1, 3, 2]);
    }

    #[test]
    fn test_non_positive_k_is_invalid() {
        let index = sample_index();
        assert!(matches!(
            index.query(&[1.0, 0.0, 0.0], 0),
            Err(QaError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.query(&[1.0, 0.0, 0.0], -3),
            Err(QaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_empty_index_returns_empty() {
        let index = VectorIndex::new();
        assert!(index.query(&[1.0, 2.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_build_rejects_mixed_dimensions() {
        let mut index = sample_index();
        let err = index
            .build(vec![entry(0, vec![1.0, 0.0]), entry(1, vec![1.0])])
            .unwrap_err();
        assert!(matches!(
            err,
            QaError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
        // Failed build leaves the old contents in place.
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_build_replaces_contents() {
        let mut index = sample_index();
        index.build(vec![entry(7, vec![0.0, 1.0])]).unwrap();
        let hits = index.query(&[0.0, 1.0], 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage_index, 7);
        assert_eq!(index.dims(), Some(2));
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let index = sample_index();
        assert!(matches!(
            index.query(&[1.0, 0.0], 2),
            Err(QaError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        ));
    }
}
