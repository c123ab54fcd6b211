//! The reranker collaborator: out of scope to implement (a cross-encoder
//! inference runtime), specified here only as the trait the Hybrid
//! Searcher calls. Errors cause fallback to RRF order, never a query
//! failure.

use crate::error::RerankerError;

/// Scores `(query, passage)` pairs jointly; higher is more relevant.
/// Implementations are blocking and expected to run on a dedicated,
/// single-threaded inference worker to avoid cache thrashing on
/// constrained hardware.
pub trait Reranker: Send + Sync {
    fn rerank(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankerError>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod test_double {
    use super::*;

    /// Scores by the count of shared characters with the query —
    /// enough to exercise precedence-over-BM25 scenarios in tests
    /// without a real cross-encoder.
    pub struct OverlapReranker;

    impl Reranker for OverlapReranker {
        fn rerank(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, RerankerError> {
            let query_chars: std::collections::HashSet<char> = query.chars().collect();
            Ok(passages
                .iter()
                .map(|p| p.chars().filter(|c| query_chars.contains(c)).count() as f32)
                .collect())
        }
    }

    /// Always fails, to exercise reranker-failure fallback to fused order.
    pub struct FailingReranker;

    impl Reranker for FailingReranker {
        fn rerank(&self, _query: &str, _passages: &[&str]) -> Result<Vec<f32>, RerankerError> {
            Err(RerankerError::CallFailed("test double always fails".into()))
        }
    }
}
