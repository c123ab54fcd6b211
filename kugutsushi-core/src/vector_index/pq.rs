//! Product quantization: split a residual vector into `M` sub-vectors,
//! each quantised independently into a `2^nbits`-entry codebook trained
//! by [`super::kmeans`].

use serde::{Deserialize, Serialize};

use super::kmeans;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProductQuantizer {
    pub m: usize,
    pub nbits: usize,
    pub sub_dim: usize,
    /// `codebooks[m]` has `2^nbits` entries, each `sub_dim` wide.
    pub codebooks: Vec<Vec<Vec<f32>>>,
}

impl ProductQuantizer {
    pub fn k_per_subspace(nbits: usize) -> usize {
        1usize << nbits
    }

    /// Trains `m` independent codebooks, one per sub-vector slice of
    /// `residuals` (each residual already normalised-vector-minus-
    /// assigned-centroid).
    pub fn train(residuals: &[Vec<f32>], dim: usize, m: usize, nbits: usize) -> Self {
        assert_eq!(dim % m, 0, "dimension must split evenly into {m} sub-vectors");
        let sub_dim = dim / m;
        let k = Self::k_per_subspace(nbits);

        let mut codebooks = Vec::with_capacity(m);
        for sub in 0..m {
            let slices: Vec<Vec<f32>> = residuals
                .iter()
                .map(|r| r[sub * sub_dim..(sub + 1) * sub_dim].to_vec())
                .collect();
            codebooks.push(kmeans::train(&slices, k, sub_dim));
        }

        Self { m, nbits, sub_dim, codebooks }
    }

    /// Encodes one residual vector into `m` codebook indices (one byte
    /// each; `nbits <= 8` so a byte always suffices).
    pub fn encode(&self, residual: &[f32]) -> Vec<u8> {
        let mut code = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let slice = &residual[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            let idx = kmeans::nearest_centroid(slice, &self.codebooks[sub]);
            code.push(idx as u8);
        }
        code
    }

    /// Reconstructs the approximate residual vector from a code: the
    /// concatenation of each sub-vector's assigned codebook entry.
    pub fn reconstruct(&self, code: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.m * self.sub_dim);
        for (sub, &idx) in code.iter().enumerate() {
            out.extend_from_slice(&self.codebooks[sub][idx as usize]);
        }
        out
    }

    /// Precomputes, for one query residual, the inner product of the
    /// query's `sub`-th slice against every codebook entry in that
    /// sub-space — an asymmetric-distance-computation (ADC) lookup
    /// table letting `score_with_table` avoid reconstructing every
    /// candidate during the coarse scan.
    pub fn build_lookup_table(&self, query_residual: &[f32]) -> Vec<Vec<f32>> {
        let mut table = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let q = &query_residual[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            table.push(self.codebooks[sub].iter().map(|c| kmeans::dot(q, c)).collect());
        }
        table
    }

    pub fn score_with_table(&self, table: &[Vec<f32>], code: &[u8]) -> f32 {
        code.iter().enumerate().map(|(sub, &idx)| table[sub][idx as usize]).sum()
    }
}
