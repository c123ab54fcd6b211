//! C4 — Vector Index.
//!
//! A self-contained, pure-Rust IVF-PQ approximate-nearest-neighbour
//! index over L2-normalised 512-dimensional vectors, with a refinement
//! ("RFlat") pass that re-scores the coarse short-list against the
//! exact PQ residual-reconstruction. No FFI binding to a native ANN
//! library — consistent with the teacher's pure-Rust posture, and
//! necessary since the on-disk artefact format (magic `KGSV01`) is this
//! crate's own.

mod kmeans;
mod persist;
mod pq;

use std::collections::BinaryHeap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::VectorIndexConfig;
use crate::error::{CoreError, Result};
use crate::types::PassageId;
use pq::ProductQuantizer;

/// Sidecar `index_state.json`: training state and parameters, checked
/// for compatibility on load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingState {
    pub dim: usize,
    pub nlist: usize,
    pub pq_m: usize,
    pub pq_nbits: usize,
    pub trained: bool,
    pub ntotal: u64,
    pub training_sample_count: u64,
    pub version: u32,
}

impl TrainingState {
    fn untrained(cfg: &VectorIndexConfig) -> Self {
        Self {
            dim: cfg.dim,
            nlist: cfg.nlist,
            pq_m: cfg.pq_m,
            pq_nbits: cfg.pq_nbits,
            trained: false,
            ntotal: 0,
            training_sample_count: 0,
            version: persist::FORMAT_VERSION,
        }
    }

    fn compatible_with(&self, cfg: &VectorIndexConfig) -> bool {
        self.dim == cfg.dim
            && self.nlist == cfg.nlist
            && self.pq_m == cfg.pq_m
            && self.pq_nbits == cfg.pq_nbits
    }
}

struct InvertedList {
    entries: Vec<(PassageId, Vec<u8>)>,
}

pub struct VectorIndex {
    cfg: VectorIndexConfig,
    state: TrainingState,
    centroids: Vec<Vec<f32>>,
    pq: Option<ProductQuantizer>,
    lists: Vec<InvertedList>,
    /// Training vectors buffered until `training_threshold` is reached.
    training_buffer: Vec<Vec<f32>>,
}

impl VectorIndex {
    pub fn new(cfg: VectorIndexConfig) -> Self {
        let state = TrainingState::untrained(&cfg);
        let nlist = cfg.nlist;
        Self {
            cfg,
            state,
            centroids: Vec::new(),
            pq: None,
            lists: (0..nlist).map(|_| InvertedList { entries: Vec::new() }).collect(),
            training_buffer: Vec::new(),
        }
    }

    pub fn is_trained(&self) -> bool {
        self.state.trained
    }

    pub fn ntotal(&self) -> u64 {
        self.state.ntotal
    }

    /// Number of entries whose id falls within `range`, used to check the
    /// cross-store count equality invariant against the Catalogue and
    /// Lexical Index.
    pub fn count_in(&self, range: crate::types::PassageIdRange) -> u64 {
        if range.is_empty() {
            return 0;
        }
        self.lists
            .iter()
            .flat_map(|l| l.entries.iter())
            .filter(|(id, _)| range.contains(id.0))
            .count() as u64
    }

    pub fn training_threshold(&self) -> usize {
        self.cfg.training_threshold.min(self.cfg.expected_corpus)
    }

    /// Buffers a vector for training. Returns `true` once the buffer has
    /// reached the training threshold and [`VectorIndex::train`] should
    /// be called.
    pub fn buffer_for_training(&mut self, vector: Vec<f32>) -> Result<bool> {
        if self.state.trained {
            return Err(CoreError::IndexCorruption(
                "cannot buffer training vectors after training has completed".into(),
            ));
        }
        self.training_buffer.push(normalise(vector, self.cfg.dim)?);
        Ok(self.training_buffer.len() >= self.training_threshold())
    }

    pub fn buffered_training_count(&self) -> usize {
        self.training_buffer.len()
    }

    /// Trains the coarse quantizer and PQ codebooks from the buffered
    /// sample (or `force`s training on whatever has been buffered so
    /// far, however small). Training may occur only once per index.
    pub fn train(&mut self, force: bool) -> Result<()> {
        if self.state.trained {
            return Err(CoreError::IndexCorruption("index is already trained".into()));
        }
        if self.training_buffer.is_empty() {
            return Err(CoreError::ResourceExhausted(
                "no training vectors buffered".into(),
            ));
        }
        if !force && self.training_buffer.len() < self.training_threshold() {
            return Err(CoreError::ResourceExhausted(
                "training threshold not yet reached".into(),
            ));
        }

        let dim = self.cfg.dim;
        self.centroids = kmeans::train(&self.training_buffer, self.cfg.nlist, dim);

        let residuals: Vec<Vec<f32>> = self
            .training_buffer
            .iter()
            .map(|v| {
                let c = kmeans::nearest_centroid(v, &self.centroids);
                residual(v, &self.centroids[c])
            })
            .collect();
        self.pq = Some(ProductQuantizer::train(&residuals, dim, self.cfg.pq_m, self.cfg.pq_nbits));

        self.state.trained = true;
        self.state.training_sample_count = self.training_buffer.len() as u64;
        self.training_buffer.clear();
        Ok(())
    }

    /// Appends `(id, vector)` pairs. Requires trained state; append-only,
    /// no duplicate-id check (the Catalogue guarantees uniqueness).
    pub fn add(&mut self, ids: &[PassageId], vectors: &[Vec<f32>]) -> Result<()> {
        if !self.state.trained {
            return Err(CoreError::IndexCorruption(
                "vectors may be added only once the index is trained".into(),
            ));
        }
        if ids.len() != vectors.len() {
            return Err(CoreError::CatalogueConflict(
                "id count does not match vector count".into(),
            ));
        }
        let pq = self.pq.as_ref().expect("trained implies pq is Some");
        for (id, v) in ids.iter().zip(vectors.iter()) {
            let v = normalise(v.clone(), self.cfg.dim)?;
            let centroid_idx = kmeans::nearest_centroid(&v, &self.centroids);
            let r = residual(&v, &self.centroids[centroid_idx]);
            let code = pq.encode(&r);
            self.lists[centroid_idx].entries.push((*id, code));
        }
        self.state.ntotal += ids.len() as u64;
        Ok(())
    }

    /// Searches for the `k` nearest neighbours (by cosine similarity,
    /// since vectors are L2-normalised and we score by inner product).
    /// Returns at most `k` entries, descending score.
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Result<Vec<(PassageId, f32)>> {
        if !self.state.trained {
            return Err(CoreError::IndexCorruption(
                "cannot search an untrained index".into(),
            ));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let pq = self.pq.as_ref().expect("trained implies pq is Some");
        let query = normalise(query.to_vec(), self.cfg.dim)?;

        let mut centroid_scores: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, kmeans::dot(&query, c)))
            .collect();
        centroid_scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let probed = centroid_scores.into_iter().take(nprobe.max(1));

        // Coarse ADC scan: gather a shortlist larger than k so the
        // refinement step has room to reorder near the top.
        let shortlist_size = (k * 4).max(k + 8);
        let mut shortlist: Vec<(PassageId, f32, usize, usize)> = Vec::new();
        for (centroid_idx, centroid_score) in probed {
            let table = pq.build_lookup_table(&residual(&query, &self.centroids[centroid_idx]));
            for (entry_idx, (id, code)) in self.lists[centroid_idx].entries.iter().enumerate() {
                let adc_score = centroid_score + pq.score_with_table(&table, code);
                shortlist.push((*id, adc_score, centroid_idx, entry_idx));
            }
        }
        shortlist.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        shortlist.truncate(shortlist_size);

        // Refinement: re-score the short-list by an exact inner product
        // against the reconstructed (centroid + PQ-decoded residual)
        // vector, which stabilises ranking near the top where ADC's
        // per-sub-vector independence assumption is weakest.
        let mut refined: BinaryHeap<ScoredId> = BinaryHeap::new();
        for (id, _adc_score, centroid_idx, entry_idx) in &shortlist {
            let (_, code) = &self.lists[*centroid_idx].entries[*entry_idx];
            let reconstructed_residual = pq.reconstruct(code);
            let mut reconstructed = self.centroids[*centroid_idx].clone();
            for (r, d) in reconstructed.iter_mut().zip(reconstructed_residual.iter()) {
                *r += d;
            }
            let exact_score = kmeans::dot(&query, &reconstructed);
            refined.push(ScoredId { id: *id, score: exact_score });
        }

        let mut out: Vec<(PassageId, f32)> = Vec::with_capacity(k.min(refined.len()));
        while out.len() < k {
            match refined.pop() {
                Some(scored) => out.push((scored.id, scored.score)),
                None => break,
            }
        }
        Ok(out)
    }

    /// Removes any entries whose id falls within `range`. Not exposed as
    /// general per-passage deletion (the crate does not support that) —
    /// used only by the Driver to roll back a partially-committed file's
    /// vectors after a crash, before the file is reprocessed from scratch.
    pub fn remove_range(&mut self, range: crate::types::PassageIdRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        for list in &mut self.lists {
            let before = list.entries.len();
            list.entries.retain(|(id, _)| !range.contains(id.0));
            self.state.ntotal -= (before - list.entries.len()) as u64;
        }
        Ok(())
    }

    /// Confirms trained state, that the code count equals the id-map
    /// length, and that the id-map is injective.
    pub fn verify(&self) -> (bool, String) {
        if !self.state.trained {
            return (false, "index is not trained".to_string());
        }
        let total_entries: usize = self.lists.iter().map(|l| l.entries.len()).sum();
        if total_entries as u64 != self.state.ntotal {
            return (
                false,
                format!(
                    "code count {total_entries} does not match recorded ntotal {}",
                    self.state.ntotal
                ),
            );
        }
        let mut seen = std::collections::HashSet::with_capacity(total_entries);
        for list in &self.lists {
            for (id, _) in &list.entries {
                if !seen.insert(id.0) {
                    return (false, format!("duplicate id {} in id-map", id.0));
                }
            }
        }
        (true, "ok".to_string())
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        persist::save(dir, &self.state, &self.centroids, self.pq.as_ref(), &self.lists)
    }

    pub fn load(dir: &Path, cfg: VectorIndexConfig) -> Result<Self> {
        let (state, centroids, pq, lists) = persist::load(dir)?;
        if !state.compatible_with(&cfg) {
            return Err(CoreError::IndexCorruption(
                "persisted vector index parameters do not match configuration".into(),
            ));
        }
        Ok(Self {
            cfg,
            state,
            centroids,
            pq,
            lists,
            training_buffer: Vec::new(),
        })
    }
}

struct ScoredId {
    id: PassageId,
    score: f32,
}

impl PartialEq for ScoredId {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}
impl Eq for ScoredId {}
impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

fn normalise(mut v: Vec<f32>, dim: usize) -> Result<Vec<f32>> {
    if v.len() != dim {
        return Err(CoreError::Embedder(crate::error::EmbedderError::DimensionMismatch {
            expected: dim,
            got: v.len(),
        }));
    }
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    Ok(v)
}

fn residual(v: &[f32], centroid: &[f32]) -> Vec<f32> {
    v.iter().zip(centroid.iter()).map(|(a, b)| a - b).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dim: usize) -> VectorIndexConfig {
        VectorIndexConfig {
            dim,
            nlist: 4,
            pq_m: 2,
            pq_nbits: 4,
            nprobe: 4,
            training_threshold: 8,
            expected_corpus: 8,
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[hot] = 1.0;
        v
    }

    fn train_index(dim: usize) -> VectorIndex {
        let mut idx = VectorIndex::new(cfg(dim));
        for i in 0..8 {
            idx.buffer_for_training(unit(dim, i % dim)).unwrap();
        }
        idx.train(false).unwrap();
        idx
    }

    #[test]
    fn untrained_index_rejects_add() {
        let mut idx = VectorIndex::new(cfg(4));
        let err = idx.add(&[PassageId(0)], &[vec![1.0, 0.0, 0.0, 0.0]]).unwrap_err();
        assert!(matches!(err, CoreError::IndexCorruption(_)));
    }

    #[test]
    fn trains_once_and_rejects_a_second_training() {
        let mut idx = train_index(4);
        let err = idx.train(true).unwrap_err();
        assert!(matches!(err, CoreError::IndexCorruption(_)));
    }

    #[test]
    fn add_then_search_finds_the_closest_vector() {
        let mut idx = train_index(4);
        let ids: Vec<PassageId> = (0..4).map(PassageId).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        idx.add(&ids, &vectors).unwrap();

        let results = idx.search(&unit(4, 2), 1, 4).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, PassageId(2));
    }

    #[test]
    fn search_returns_at_most_k_results() {
        let mut idx = train_index(4);
        let ids: Vec<PassageId> = (0..4).map(PassageId).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        idx.add(&ids, &vectors).unwrap();
        let results = idx.search(&unit(4, 0), 2, 4).unwrap();
        assert!(results.len() <= 2);
    }

    #[test]
    fn verify_detects_consistent_state() {
        let mut idx = train_index(4);
        let ids: Vec<PassageId> = (0..4).map(PassageId).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        idx.add(&ids, &vectors).unwrap();
        let (ok, detail) = idx.verify();
        assert!(ok, "{detail}");
    }

    #[test]
    fn save_then_load_round_trips_search_results() {
        let mut idx = train_index(4);
        let ids: Vec<PassageId> = (0..4).map(PassageId).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        idx.add(&ids, &vectors).unwrap();
        let before = idx.search(&unit(4, 1), 2, 4).unwrap();

        let dir = tempfile::tempdir().unwrap();
        idx.save(dir.path()).unwrap();
        let loaded = VectorIndex::load(dir.path(), cfg(4)).unwrap();
        let after = loaded.search(&unit(4, 1), 2, 4).unwrap();

        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.0, b.0);
            assert!((a.1 - b.1).abs() < 1e-6);
        }
    }

    #[test]
    fn remove_range_drops_only_matching_ids_and_updates_ntotal() {
        let mut idx = train_index(4);
        let ids: Vec<PassageId> = (0..4).map(PassageId).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        idx.add(&ids, &vectors).unwrap();
        idx.remove_range(crate::types::PassageIdRange { first: 1, last: 2 }).unwrap();
        assert_eq!(idx.ntotal(), 2);
        let (ok, detail) = idx.verify();
        assert!(ok, "{detail}");
    }

    #[test]
    fn count_in_matches_added_range() {
        let mut idx = train_index(4);
        let ids: Vec<PassageId> = (0..4).map(PassageId).collect();
        let vectors: Vec<Vec<f32>> = (0..4).map(|i| unit(4, i)).collect();
        idx.add(&ids, &vectors).unwrap();
        assert_eq!(idx.count_in(crate::types::PassageIdRange { first: 0, last: 3 }), 4);
        assert_eq!(idx.count_in(crate::types::PassageIdRange { first: 1, last: 2 }), 2);
    }

    #[test]
    fn load_rejects_incompatible_parameters() {
        let idx = train_index(4);
        let dir = tempfile::tempdir().unwrap();
        idx.save(dir.path()).unwrap();
        let mut bad_cfg = cfg(4);
        bad_cfg.nlist = 99;
        let err = VectorIndex::load(dir.path(), bad_cfg).unwrap_err();
        assert!(matches!(err, CoreError::IndexCorruption(_)));
    }
}
