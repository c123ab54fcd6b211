//! # kugutsushi-core
//!
//! The retrieval core of an embeddable hybrid search engine over Japanese
//! PDF corpora, built to run on memory-constrained single-board hardware
//! while serving sub-second queries over roughly a million indexed
//! passages.
//!
//! A passage is indexed twice — once as a dense vector in an IVF-PQ
//! approximate-nearest-neighbour structure ([`vector_index`]), once as a
//! sparse term-frequency record in a 2-gram BM25 lexical index
//! ([`lexical_index`]) — and queries are answered by fusing both signals
//! with Reciprocal Rank Fusion, optionally refined by a cross-encoder
//! reranker ([`searcher`]).
//!
//! ## Module organization
//!
//! - [`text_filter`] — rejects low-information pages (scan artefacts,
//!   tables of contents, figure directories) before they are chunked.
//! - [`extractor`] — turns PDF bytes into page text, then into fixed-size
//!   overlapping passage chunks, on top of the from-scratch reader in
//!   [`pdf`].
//! - [`catalogue`] — the authoritative id-assigning store mapping
//!   passage ids to source, page, chunk, and text.
//! - [`vector_index`] — the IVF-PQ ANN structure over normalised dense
//!   vectors.
//! - [`lexical_index`] — the 2-gram BM25 index backed by compact
//!   posting-list blobs.
//! - [`driver`] — orchestrates the above with batching, deduplication,
//!   checkpoints, and crash-safe resumability.
//! - [`searcher`] — runs the vector and lexical sub-retrievers in
//!   parallel, fuses their candidates, and optionally reranks.
//! - [`embedder`] / [`reranker`] — the plain traits the out-of-scope ML
//!   runtimes implement; this crate never depends on a concrete
//!   inference engine.
//! - [`config`] — every tunable named by the design, layered over
//!   documented defaults.
//! - [`error`] — the crate-wide error taxonomy.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::{Arc, RwLock};
//! use kugutsushi_core::config::Config;
//! use kugutsushi_core::driver::IndexingDriver;
//! use kugutsushi_core::embedder::Embedder;
//! use kugutsushi_core::searcher::HybridSearcher;
//! use kugutsushi_core::stores::{Stores, StoreLayout};
//! use kugutsushi_core::types::SearchMode;
//!
//! # struct MyEmbedder;
//! # impl Embedder for MyEmbedder {
//! #     fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, kugutsushi_core::error::EmbedderError> {
//! #         Ok(texts.iter().map(|_| vec![0.0; 512]).collect())
//! #     }
//! # }
//! # fn main() -> kugutsushi_core::error::Result<()> {
//! let config = Config::load(std::path::Path::new("kugutsushi.toml"))?;
//! let layout = StoreLayout::new("embeddings");
//! let stores = Arc::new(RwLock::new(Stores::open(&layout, &config)?));
//! let embedder: Arc<dyn Embedder> = Arc::new(MyEmbedder);
//!
//! let mut driver = IndexingDriver::new(stores.clone(), &layout, config.clone(), embedder.clone());
//! driver.recover()?;
//! let report = driver.ingest_directory(std::path::Path::new("corpus/"))?;
//! stores.read().unwrap().save_vector_index(&layout)?;
//! println!("indexed {} passages", report.total_passages());
//!
//! let searcher = HybridSearcher::new(stores, config, Some(embedder), None);
//! let response = searcher.search("機械学習", 5, SearchMode::Hybrid)?;
//! for result in response.results {
//!     println!("{}:{} ({:.3}) {}", result.source, result.page, result.score, result.snippet);
//! }
//! # Ok(())
//! # }
//! ```

pub mod catalogue;
pub mod config;
pub mod driver;
pub mod embedder;
pub mod error;
pub mod extractor;
pub mod lexical_index;
pub mod overflow;
pub mod pdf;
pub mod reranker;
pub mod searcher;
pub mod stores;
pub mod text_filter;
pub mod types;
pub mod vector_index;

/// Convenience re-exports of the crate's most commonly used types.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::driver::{FileOutcome, IndexingDriver, IngestReport};
    pub use crate::embedder::Embedder;
    pub use crate::error::{CoreError, Result};
    pub use crate::reranker::Reranker;
    pub use crate::searcher::HybridSearcher;
    pub use crate::stores::{SharedStores, StoreLayout, Stores};
    pub use crate::types::{SearchMode, SearchResponse, SearchResult};
}

/// Crate version, surfaced for the out-of-scope `/status` endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
