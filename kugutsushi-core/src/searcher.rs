//! C7 — Hybrid Searcher.
//!
//! Runs the Vector Index and Lexical Index sub-retrievers in parallel on
//! `rayon::join`, fuses their candidate lists by Reciprocal Rank Fusion,
//! optionally reranks the fused pool with a cross-encoder, and hydrates
//! the final ids from the Catalogue into snippeted results. No async
//! runtime — the two sub-retrievers are blocking calls dispatched onto
//! rayon's worker pool, matching the "small worker pool, serial fusion"
//! scheduling model.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{Config, FusionConfig};
use crate::embedder::Embedder;
use crate::error::{CoreError, RerankerError, Result};
use crate::reranker::Reranker;
use crate::stores::SharedStores;
use crate::types::{PassageId, SearchMode, SearchResponse, SearchResult, StageTimings};

pub struct HybridSearcher {
    stores: SharedStores,
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    /// Test-injectable substitute for a real memory probe (the core has
    /// no platform crate for that); defaults to "plenty", so the soft
    /// ceiling only bites when a caller deliberately sets it low.
    available_memory_mb: AtomicU64,
}

impl HybridSearcher {
    pub fn new(
        stores: SharedStores,
        config: Config,
        embedder: Option<Arc<dyn Embedder>>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            stores,
            config,
            embedder,
            reranker,
            available_memory_mb: AtomicU64::new(u64::MAX),
        }
    }

    pub fn set_available_memory_mb(&self, mb: u64) {
        self.available_memory_mb.store(mb, AtomicOrdering::Relaxed);
    }

    /// Answers one query. `top_k` must not exceed `config.max_top_k`; an
    /// empty query or `top_k == 0` return an empty, non-degraded result
    /// rather than an error.
    pub fn search(&self, query: &str, top_k: usize, mode: SearchMode) -> Result<SearchResponse> {
        let total_start = Instant::now();
        if top_k > self.config.max_top_k {
            return Err(CoreError::QueryDegraded(format!(
                "top_k {top_k} exceeds the maximum of {}",
                self.config.max_top_k
            )));
        }
        if top_k == 0 || query.trim().is_empty() {
            return Ok(SearchResponse {
                results: Vec::new(),
                degraded: false,
                timings_ms: StageTimings { vector_ms: 0, bm25_ms: 0, rerank_ms: 0, total_ms: elapsed_ms(total_start) },
            });
        }

        let mut degraded_by_memory = false;
        let mode = if matches!(mode, SearchMode::HybridRerank)
            && self.available_memory_mb.load(AtomicOrdering::Relaxed) < self.config.reranker_min_available_mb
        {
            tracing::warn!("available memory below the reranker threshold, downgrading to hybrid mode");
            degraded_by_memory = true;
            SearchMode::Hybrid
        } else {
            mode
        };

        let shortlist_n = (top_k * self.config.fusion.shortlist_multiplier).max(self.config.fusion.shortlist_floor);
        let want_vector = matches!(mode, SearchMode::Vector | SearchMode::Hybrid | SearchMode::HybridRerank);
        let want_bm25 = matches!(mode, SearchMode::Hybrid | SearchMode::HybridRerank);

        let (vector_outcome, bm25_outcome) = rayon::join(
            || if want_vector { self.run_vector(query, shortlist_n) } else { SubRetrieverOutcome::skipped() },
            || if want_bm25 { self.run_bm25(query, shortlist_n) } else { SubRetrieverOutcome::skipped() },
        );

        let degraded = degraded_by_memory || vector_outcome.degraded || bm25_outcome.degraded;

        let mut fused = fuse(&vector_outcome.results, &bm25_outcome.results, &self.config.fusion);

        let pool_size = if matches!(mode, SearchMode::HybridRerank) {
            self.config.fusion.rerank_pool_max.min(fused.len())
        } else {
            top_k.min(fused.len())
        };
        fused.truncate(pool_size);

        let mut rerank_ms = 0u64;
        let mut ordered: Vec<(PassageId, f32)> = if matches!(mode, SearchMode::HybridRerank) && !fused.is_empty() {
            match self.rerank(query, &fused) {
                Ok((scores, elapsed)) => {
                    rerank_ms = elapsed;
                    blend(&fused, &scores)
                }
                Err(err) => {
                    tracing::warn!(error = %err, "reranker failed, falling back to fused order");
                    fused.iter().map(|c| (c.id, c.rrf_score as f32)).collect()
                }
            }
        } else {
            fused.iter().map(|c| (c.id, c.rrf_score as f32)).collect()
        };

        ordered.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then_with(|| a.0 .0.cmp(&b.0 .0))
        });
        ordered.truncate(top_k);

        let ids: Vec<PassageId> = ordered.iter().map(|(id, _)| *id).collect();
        let passages = {
            let guard = self.stores.read().map_err(|_| CoreError::QueryDegraded("stores lock poisoned".into()))?;
            guard.catalogue.get_passages_by_ids(&ids)?
        };

        let results: Vec<SearchResult> = ordered
            .iter()
            .zip(passages.iter())
            .map(|((id, score), passage)| SearchResult {
                id: *id,
                source: passage.source_path.clone(),
                page: passage.page_number,
                score: *score,
                text: passage.text.clone(),
                snippet: extract_snippet(&passage.text, query),
            })
            .collect();

        Ok(SearchResponse {
            results,
            degraded,
            timings_ms: StageTimings {
                vector_ms: vector_outcome.elapsed_ms,
                bm25_ms: bm25_outcome.elapsed_ms,
                rerank_ms,
                total_ms: elapsed_ms(total_start),
            },
        })
    }

    fn run_vector(&self, query_text: &str, shortlist_n: usize) -> SubRetrieverOutcome {
        let start = Instant::now();
        let deadline = Duration::from_millis(self.config.deadlines.vector_ms);
        let outcome = (|| -> Result<Vec<(PassageId, f32)>> {
            let embedder = self
                .embedder
                .as_ref()
                .ok_or_else(|| CoreError::QueryDegraded("no embedder configured".into()))?;
            let vectors = embedder.embed(std::slice::from_ref(&query_text.to_string()))?;
            let query_vector = vectors
                .into_iter()
                .next()
                .ok_or_else(|| CoreError::QueryDegraded("embedder returned no vector for the query".into()))?;
            let guard = self.stores.read().map_err(|_| CoreError::QueryDegraded("stores lock poisoned".into()))?;
            if !guard.vector_index.is_trained() {
                return Err(CoreError::QueryDegraded("vector index is not yet trained".into()));
            }
            guard.vector_index.search(&query_vector, shortlist_n, self.config.vector_index.nprobe)
        })();
        finish_sub_retriever(outcome, start, deadline, "vector")
    }

    fn run_bm25(&self, query_text: &str, shortlist_n: usize) -> SubRetrieverOutcome {
        let start = Instant::now();
        let deadline = Duration::from_millis(self.config.deadlines.bm25_ms);
        let outcome = (|| -> Result<Vec<(PassageId, f32)>> {
            let guard = self.stores.read().map_err(|_| CoreError::QueryDegraded("stores lock poisoned".into()))?;
            guard.lexical_index.search(query_text, shortlist_n)
        })();
        finish_sub_retriever(outcome, start, deadline, "bm25")
    }

    fn rerank(&self, query: &str, fused: &[FusedCandidate]) -> Result<(Vec<f32>, u64)> {
        let start = Instant::now();
        let reranker = self
            .reranker
            .as_ref()
            .ok_or_else(|| CoreError::Reranker(RerankerError::CallFailed("no reranker configured".into())))?;
        let ids: Vec<PassageId> = fused.iter().map(|c| c.id).collect();
        let passages = {
            let guard = self.stores.read().map_err(|_| CoreError::QueryDegraded("stores lock poisoned".into()))?;
            guard.catalogue.get_passages_by_ids(&ids)?
        };
        let texts: Vec<&str> = passages.iter().map(|p| p.text.as_str()).collect();
        let scores = reranker.rerank(query, &texts)?;
        if scores.len() != texts.len() {
            return Err(CoreError::Reranker(RerankerError::CallFailed(
                "reranker returned a different number of scores than passages".into(),
            )));
        }
        Ok((scores, elapsed_ms(start)))
    }
}

struct SubRetrieverOutcome {
    results: Vec<(PassageId, f32)>,
    degraded: bool,
    elapsed_ms: u64,
}

impl SubRetrieverOutcome {
    fn skipped() -> Self {
        Self { results: Vec::new(), degraded: false, elapsed_ms: 0 }
    }
}

/// Synchronous calls can't truly be preempted without an async runtime;
/// deadline expiry is approximated by checking elapsed time once the
/// call returns and flagging degraded mode exactly as an outright error
/// would, per the suspension-points contract.
fn finish_sub_retriever(
    outcome: Result<Vec<(PassageId, f32)>>,
    start: Instant,
    deadline: Duration,
    name: &str,
) -> SubRetrieverOutcome {
    let elapsed = start.elapsed();
    match outcome {
        Ok(results) if elapsed <= deadline => {
            SubRetrieverOutcome { results, degraded: false, elapsed_ms: elapsed_ms(start) }
        }
        Ok(results) => {
            tracing::warn!(retriever = name, elapsed_ms = elapsed.as_millis() as u64, "sub-retriever exceeded its deadline");
            SubRetrieverOutcome { results, degraded: true, elapsed_ms: elapsed_ms(start) }
        }
        Err(err) => {
            tracing::warn!(retriever = name, error = %err, "sub-retriever failed, degrading to the remaining one");
            SubRetrieverOutcome { results: Vec::new(), degraded: true, elapsed_ms: elapsed_ms(start) }
        }
    }
}

struct FusedCandidate {
    id: PassageId,
    rrf_score: f64,
    vector_score: f32,
}

/// Reciprocal Rank Fusion over two already-ranked candidate lists. Ids
/// absent from a list contribute 0 for it; the result is sorted by
/// descending RRF score, ties broken by descending vector score, then
/// by ascending id.
fn fuse(vector: &[(PassageId, f32)], bm25: &[(PassageId, f32)], cfg: &FusionConfig) -> Vec<FusedCandidate> {
    let mut acc: HashMap<PassageId, (f64, f32)> = HashMap::new();
    for (rank, (id, score)) in vector.iter().enumerate() {
        let entry = acc.entry(*id).or_insert((0.0, 0.0));
        entry.0 += cfg.vector_weight / (cfg.k_rrf + (rank + 1) as f64);
        entry.1 = *score;
    }
    for (rank, (id, _score)) in bm25.iter().enumerate() {
        let entry = acc.entry(*id).or_insert((0.0, 0.0));
        entry.0 += cfg.bm25_weight / (cfg.k_rrf + (rank + 1) as f64);
    }
    let mut out: Vec<FusedCandidate> = acc
        .into_iter()
        .map(|(id, (rrf_score, vector_score))| FusedCandidate { id, rrf_score, vector_score })
        .collect();
    out.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.vector_score.partial_cmp(&a.vector_score).unwrap_or(Ordering::Equal))
            .then_with(|| a.id.0.cmp(&b.id.0))
    });
    out
}

/// `0.5 * normalise(rrf_score) + 0.5 * sigmoid(rerank_score)`, min-max
/// normalising the RRF score across the reranked pool.
fn blend(fused: &[FusedCandidate], rerank_scores: &[f32]) -> Vec<(PassageId, f32)> {
    let min = fused.iter().map(|c| c.rrf_score).fold(f64::INFINITY, f64::min);
    let max = fused.iter().map(|c| c.rrf_score).fold(f64::NEG_INFINITY, f64::max);
    fused
        .iter()
        .zip(rerank_scores.iter())
        .map(|(c, &rerank)| {
            let normalised_rrf = if max > min { (c.rrf_score - min) / (max - min) } else { 1.0 };
            let blended = 0.5 * normalised_rrf + 0.5 * sigmoid(rerank as f64);
            (c.id, blended as f32)
        })
        .collect()
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// A 160-character window centred on the earliest query-term match, or
/// the text prefix if no term matches. Measured in `char`s so the
/// window never splits a multi-byte Japanese codepoint.
fn extract_snippet(text: &str, query: &str) -> String {
    const WINDOW: usize = 160;
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= WINDOW {
        return text.to_string();
    }
    let terms: Vec<&str> = {
        let split: Vec<&str> = query.split_whitespace().filter(|t| !t.is_empty()).collect();
        if split.is_empty() {
            vec![query]
        } else {
            split
        }
    };
    let best = terms.iter().find_map(|term| find_char_index(&chars, term));
    match best {
        Some(pos) => {
            let half = WINDOW / 2;
            let start = pos.saturating_sub(half);
            let end = (start + WINDOW).min(chars.len());
            let start = end.saturating_sub(WINDOW);
            chars[start..end].iter().collect()
        }
        None => chars[..WINDOW].iter().collect(),
    }
}

fn find_char_index(chars: &[char], term: &str) -> Option<usize> {
    let term_chars: Vec<char> = term.chars().collect();
    if term_chars.is_empty() || term_chars.len() > chars.len() {
        return None;
    }
    chars.windows(term_chars.len()).position(|w| w == term_chars.as_slice())
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Catalogue;
    use crate::embedder::test_double::HashEmbedder;
    use crate::lexical_index::LexicalIndex;
    use crate::reranker::test_double::{FailingReranker, OverlapReranker};
    use crate::stores::Stores;
    use crate::types::{Passage, PassageIdRange};
    use crate::vector_index::VectorIndex;
    use std::sync::RwLock;

    fn cfg(dim: usize) -> Config {
        Config {
            vector_index: crate::config::VectorIndexConfig {
                dim,
                nlist: 2,
                pq_m: 2,
                pq_nbits: 4,
                nprobe: 2,
                training_threshold: 4,
                expected_corpus: 4,
            },
            ..Config::default()
        }
    }

    fn seeded_stores(cfg: &Config, docs: &[(&str, &str)]) -> SharedStores {
        let catalogue = Catalogue::open_in_memory().unwrap();
        let mut vector_index = VectorIndex::new(cfg.vector_index.clone());
        let mut lexical_index = LexicalIndex::open_in_memory(cfg.lexical_index.clone()).unwrap();

        let embedder = HashEmbedder { dim: cfg.vector_index.dim };
        let range = catalogue.assign_ids(docs.len() as u64).unwrap();
        let mut passages = Vec::new();
        let mut vectors = Vec::new();
        for (offset, (source, text)) in docs.iter().enumerate() {
            let id = PassageId(range.first + offset as u64);
            passages.push(Passage {
                id,
                source_path: source.to_string(),
                page_number: 1,
                chunk_index: 0,
                text: text.to_string(),
            });
            vectors.push(crate::embedder::Embedder::embed(&embedder, &[text.to_string()]).unwrap().remove(0));
            lexical_index.add(id, text);
        }
        catalogue.commit_passages(&passages).unwrap();
        lexical_index.flush().unwrap();

        for v in &vectors {
            vector_index.buffer_for_training(v.clone()).unwrap();
        }
        vector_index.train(true).unwrap();
        let ids: Vec<PassageId> = (0..docs.len() as u64).map(|i| PassageId(range.first + i)).collect();
        vector_index.add(&ids, &vectors).unwrap();

        let mut stores = Stores::open_in_memory(cfg).unwrap();
        stores.catalogue = catalogue;
        stores.vector_index = vector_index;
        stores.lexical_index = lexical_index;
        Arc::new(RwLock::new(stores))
    }

    #[test]
    fn empty_query_returns_empty_result_not_an_error() {
        let cfg = cfg(8);
        let stores = seeded_stores(&cfg, &[("a.pdf", "機械学習は統計と最適化の交点にある")]);
        let searcher = HybridSearcher::new(stores, cfg, Some(Arc::new(HashEmbedder { dim: 8 })), None);
        let resp = searcher.search("   ", 5, SearchMode::Hybrid).unwrap();
        assert!(resp.results.is_empty());
        assert!(!resp.degraded);
    }

    #[test]
    fn top_k_zero_returns_empty_result() {
        let cfg = cfg(8);
        let stores = seeded_stores(&cfg, &[("a.pdf", "機械学習は統計と最適化の交点にある")]);
        let searcher = HybridSearcher::new(stores, cfg, Some(Arc::new(HashEmbedder { dim: 8 })), None);
        let resp = searcher.search("機械学習", 0, SearchMode::Hybrid).unwrap();
        assert!(resp.results.is_empty());
    }

    #[test]
    fn top_k_over_maximum_is_rejected() {
        let cfg = cfg(8);
        let stores = seeded_stores(&cfg, &[("a.pdf", "機械学習は統計と最適化の交点にある")]);
        let searcher = HybridSearcher::new(stores, cfg.clone(), Some(Arc::new(HashEmbedder { dim: 8 })), None);
        let err = searcher.search("機械学習", cfg.max_top_k + 1, SearchMode::Hybrid).unwrap_err();
        assert!(matches!(err, CoreError::QueryDegraded(_)));
    }

    #[test]
    fn hybrid_search_finds_the_matching_passage() {
        let cfg = cfg(8);
        let stores = seeded_stores(
            &cfg,
            &[
                ("a.pdf", "機械学習は統計と最適化の交点にある手法である"),
                ("b.pdf", "今日の天気は晴れで気温も穏やかだった"),
            ],
        );
        let searcher = HybridSearcher::new(stores, cfg, Some(Arc::new(HashEmbedder { dim: 8 })), None);
        let resp = searcher.search("機械学習", 5, SearchMode::Hybrid).unwrap();
        assert!(!resp.results.is_empty());
        assert_eq!(resp.results[0].source, "a.pdf");
        assert!(resp.results[0].score > 0.0);
        assert!(!resp.degraded);
    }

    #[test]
    fn missing_embedder_degrades_to_bm25_only() {
        let cfg = cfg(8);
        let stores = seeded_stores(
            &cfg,
            &[("a.pdf", "Elixirに関する記述がここにあります十分な長さの本文")],
        );
        let searcher = HybridSearcher::new(stores, cfg, None, None);
        let resp = searcher.search("Elixir", 5, SearchMode::Hybrid).unwrap();
        assert!(resp.degraded);
        assert!(!resp.results.is_empty());
    }

    #[test]
    fn reranker_can_reorder_results_ahead_of_bm25_rank() {
        let cfg = cfg(8);
        let stores = seeded_stores(
            &cfg,
            &[
                ("x.pdf", "あいうえおかきくけこさしすせそたちつてと"),
                ("y.pdf", "querymatchquerymatchquerymatchquerymatch"),
            ],
        );
        let searcher = HybridSearcher::new(
            stores,
            cfg,
            Some(Arc::new(HashEmbedder { dim: 8 })),
            Some(Arc::new(OverlapReranker)),
        );
        let resp = searcher.search("querymatch", 2, SearchMode::HybridRerank).unwrap();
        assert_eq!(resp.results.first().map(|r| r.source.as_str()), Some("y.pdf"));
    }

    #[test]
    fn reranker_failure_falls_back_to_fused_order() {
        let cfg = cfg(8);
        let stores = seeded_stores(&cfg, &[("a.pdf", "機械学習は統計と最適化の交点にある手法である")]);
        let searcher = HybridSearcher::new(
            stores,
            cfg,
            Some(Arc::new(HashEmbedder { dim: 8 })),
            Some(Arc::new(FailingReranker)),
        );
        let resp = searcher.search("機械学習", 5, SearchMode::HybridRerank).unwrap();
        assert!(!resp.results.is_empty());
    }

    #[test]
    fn snippet_centres_on_the_query_term_for_long_passages() {
        let filler_a = "あ".repeat(200);
        let filler_b = "い".repeat(200);
        let text = format!("{filler_a}機械学習{filler_b}");
        let snippet = extract_snippet(&text, "機械学習");
        assert!(snippet.contains("機械学習"));
        assert!(snippet.chars().count() <= 160);
    }

    #[test]
    fn low_available_memory_disables_rerank_mode() {
        let cfg = cfg(8);
        let stores = seeded_stores(&cfg, &[("a.pdf", "機械学習は統計と最適化の交点にある手法である")]);
        let min_mb = cfg.reranker_min_available_mb;
        let searcher = HybridSearcher::new(
            stores,
            cfg,
            Some(Arc::new(HashEmbedder { dim: 8 })),
            Some(Arc::new(FailingReranker)),
        );
        searcher.set_available_memory_mb(min_mb - 1);
        let resp = searcher.search("機械学習", 5, SearchMode::HybridRerank).unwrap();
        assert!(resp.degraded);
    }

    proptest::proptest! {
        /// RRF is rank-local: appending extra, lower-ranked ids to the tail
        /// of either input list must not change the fused score already
        /// assigned to an id whose rank in both lists is unaffected.
        #[test]
        fn fuse_score_is_unaffected_by_ids_appended_after_it(
            n in 1usize..20,
            extra_vector in 0usize..10,
            extra_bm25 in 0usize..10,
        ) {
            let cfg = FusionConfig::default();
            let vector: Vec<(PassageId, f32)> = (0..n as u64).map(|i| (PassageId(i), 1.0 / (i as f32 + 1.0))).collect();
            let bm25: Vec<(PassageId, f32)> = (0..n as u64).map(|i| (PassageId(i + 1000), 1.0 / (i as f32 + 1.0))).collect();

            let base = fuse(&vector, &bm25, &cfg);
            let base_scores: std::collections::HashMap<PassageId, f64> =
                base.iter().map(|c| (c.id, c.rrf_score)).collect();

            let mut vector_ext = vector.clone();
            for i in 0..extra_vector {
                vector_ext.push((PassageId(2000 + i as u64), 0.01));
            }
            let mut bm25_ext = bm25.clone();
            for i in 0..extra_bm25 {
                bm25_ext.push((PassageId(3000 + i as u64), 0.01));
            }

            let extended = fuse(&vector_ext, &bm25_ext, &cfg);
            for c in &extended {
                if let Some(&base_score) = base_scores.get(&c.id) {
                    proptest::prop_assert!((c.rrf_score - base_score).abs() < 1e-9);
                }
            }
        }
    }
}
