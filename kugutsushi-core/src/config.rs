//! Crate-wide configuration.
//!
//! Every tunable named in the design is represented here with the default
//! called out by the spec. Configuration is loaded from an optional TOML
//! file and falls back to [`Config::default`] entirely when absent, matching
//! the teacher's "best-effort config, hard defaults" posture.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Sliding-window chunk size, in characters.
    pub chunk_window: usize,
    /// Overlap between consecutive chunks, in characters.
    pub chunk_overlap: usize,
    /// Bounded thread pool size for PDF page parsing.
    pub page_parse_workers: usize,
    /// Minimum non-whitespace characters to keep a page (C1).
    pub min_page_chars: usize,
    /// Maximum ratio of non-Japanese, non-ASCII-letter characters to keep a page (C1).
    pub max_foreign_ratio: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            chunk_window: 400,
            chunk_overlap: 50,
            page_parse_workers: 4,
            min_page_chars: 50,
            max_foreign_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorIndexConfig {
    pub dim: usize,
    pub nlist: usize,
    pub pq_m: usize,
    pub pq_nbits: usize,
    pub nprobe: usize,
    /// Training triggers once this many (or `expected_corpus`, if smaller) vectors are buffered.
    pub training_threshold: usize,
    /// Upper bound applied to `training_threshold` via `min(training_threshold, expected_corpus)`.
    pub expected_corpus: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            nlist: 256,
            pq_m: 16,
            pq_nbits: 8,
            nprobe: 8,
            training_threshold: 100_000,
            expected_corpus: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LexicalIndexConfig {
    pub k1: f64,
    pub b: f64,
    pub min_df: u64,
}

impl Default for LexicalIndexConfig {
    fn default() -> Self {
        Self {
            k1: 1.2,
            b: 0.75,
            min_df: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Maximum pending chunks buffered before a forced flush.
    pub batch_size: usize,
    /// Retry count for a failed embedding batch before the batch is marked failed.
    pub embed_retry_count: u32,
    pub embed_retry_backoff_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            embed_retry_count: 1,
            embed_retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FusionConfig {
    pub k_rrf: f64,
    pub vector_weight: f64,
    pub bm25_weight: f64,
    pub rerank_pool_max: usize,
    pub shortlist_floor: usize,
    pub shortlist_multiplier: usize,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            k_rrf: 60.0,
            vector_weight: 0.7,
            bm25_weight: 0.3,
            rerank_pool_max: 30,
            shortlist_floor: 40,
            shortlist_multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeadlineConfig {
    pub vector_ms: u64,
    pub bm25_ms: u64,
    pub rerank_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            vector_ms: 200,
            bm25_ms: 500,
            rerank_ms: 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub extraction: ExtractionConfig,
    pub vector_index: VectorIndexConfig,
    pub lexical_index: LexicalIndexConfig,
    pub driver: DriverConfig,
    pub fusion: FusionConfig,
    pub deadlines: DeadlineConfig,
    /// Default `top_k` for queries that don't specify one.
    pub default_top_k: usize,
    /// Maximum `top_k` accepted; larger requests are rejected (HTTP 400 upstream).
    pub max_top_k: usize,
    /// Available-RAM threshold below which reranker mode is disabled. A heuristic
    /// inherited from a 4GB SBC target, intentionally configurable rather than fixed.
    pub reranker_min_available_mb: u64,
    /// Number of worker threads used for parallel sub-retriever dispatch.
    pub search_workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extraction: ExtractionConfig::default(),
            vector_index: VectorIndexConfig::default(),
            lexical_index: LexicalIndexConfig::default(),
            driver: DriverConfig::default(),
            fusion: FusionConfig::default(),
            deadlines: DeadlineConfig::default(),
            default_top_k: 5,
            max_top_k: 50,
            reranker_min_available_mb: 500,
            search_workers: 2,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults for any
    /// field the file omits. Missing file is not an error; a malformed file is.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(err.into()),
        };
        toml::from_str(&text).map_err(|err| CoreError::Config(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.vector_index.nlist, 256);
        assert_eq!(cfg.vector_index.pq_m, 16);
        assert_eq!(cfg.vector_index.pq_nbits, 8);
        assert_eq!(cfg.vector_index.nprobe, 8);
        assert_eq!(cfg.lexical_index.k1, 1.2);
        assert_eq!(cfg.lexical_index.b, 0.75);
        assert_eq!(cfg.fusion.k_rrf, 60.0);
        assert_eq!(cfg.fusion.vector_weight, 0.7);
        assert_eq!(cfg.fusion.bm25_weight, 0.3);
        assert_eq!(cfg.max_top_k, 50);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/kugutsushi.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn partial_toml_overrides_only_specified_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kugutsushi.toml");
        std::fs::write(&path, "[vector_index]\nnprobe = 16\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.vector_index.nprobe, 16);
        assert_eq!(cfg.vector_index.nlist, 256);
    }
}
