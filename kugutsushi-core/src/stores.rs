//! The three persistent stores bundled behind a single lease, matching
//! the concurrency model's "single-writer/multi-reader" discipline:
//! indexing holds the write guard for a flush's duration, search
//! acquires a read guard per query. A bare `std::sync::RwLock` rather
//! than anything fancier — this crate has no async runtime, and the
//! access pattern (long write, short read, file-boundary granularity)
//! doesn't need one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::catalogue::Catalogue;
use crate::config::Config;
use crate::error::Result;
use crate::lexical_index::LexicalIndex;
use crate::types::{IndexStats, Snapshot};
use crate::vector_index::VectorIndex;

pub struct Stores {
    pub catalogue: Catalogue,
    pub vector_index: VectorIndex,
    pub lexical_index: LexicalIndex,
    generation: AtomicU64,
}

/// Conventional on-disk layout root: `faiss.index` + `index_state.json`
/// (via [`VectorIndex::save`]/[`VectorIndex::load`]), `metadata.db`
/// (Catalogue), `bm25.db` (LexicalIndex).
pub struct StoreLayout {
    pub root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.root.clone()
    }

    pub fn catalogue_path(&self) -> PathBuf {
        self.root.join("metadata.db")
    }

    pub fn lexical_path(&self) -> PathBuf {
        self.root.join("bm25.db")
    }

    pub fn overflow_path(&self) -> PathBuf {
        self.root.join("overflow.jsonl")
    }
}

impl Stores {
    pub fn open(layout: &StoreLayout, config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&layout.root)?;
        let catalogue = Catalogue::open(&layout.catalogue_path())?;
        let lexical_index = LexicalIndex::open(&layout.lexical_path(), config.lexical_index.clone())?;
        let vector_index = if layout.vector_dir().join("index_state.json").exists() {
            VectorIndex::load(&layout.vector_dir(), config.vector_index.clone())?
        } else {
            VectorIndex::new(config.vector_index.clone())
        };
        Ok(Self {
            catalogue,
            vector_index,
            lexical_index,
            generation: AtomicU64::new(0),
        })
    }

    pub fn open_in_memory(config: &Config) -> Result<Self> {
        Ok(Self {
            catalogue: Catalogue::open_in_memory()?,
            vector_index: VectorIndex::new(config.vector_index.clone()),
            lexical_index: LexicalIndex::open_in_memory(config.lexical_index.clone())?,
            generation: AtomicU64::new(0),
        })
    }

    pub fn save_vector_index(&self, layout: &StoreLayout) -> Result<()> {
        self.vector_index.save(&layout.vector_dir())
    }

    /// Bumped at every file-commit boundary; a caller can compare two
    /// [`Snapshot`]s to know whether the visible state advanced between
    /// them.
    pub fn bump_generation(&self) -> Snapshot {
        Snapshot(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot(self.generation.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> Result<IndexStats> {
        let counts = self.catalogue.counts()?;
        Ok(IndexStats {
            passages: counts.passages,
            files: counts.files,
            vectors_trained: self.vector_index.is_trained(),
            degraded_capable: true,
        })
    }
}

pub fn default_layout(root: &Path) -> StoreLayout {
    StoreLayout::new(root)
}

/// The single-writer/multi-reader lease: the Driver acquires the
/// write guard for a flush's duration, the Searcher a read guard per
/// query.
pub type SharedStores = Arc<RwLock<Stores>>;
