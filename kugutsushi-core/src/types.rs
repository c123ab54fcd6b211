//! Shared data model: the Passage/File Record forest described in the
//! design's data model, plus the small cross-cutting types the individual
//! components (C1-C7) pass between each other.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Identity of a passage, assigned once by the Catalogue and never reused.
/// A newtype rather than a bare `u64` so ids from C3 can't be silently
/// confused with, say, a PQ code index or a rank position at the C4/C5
/// boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PassageId(pub u64);

impl std::fmt::Display for PassageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for PassageId {
    fn from(v: u64) -> Self {
        PassageId(v)
    }
}

/// An inclusive `[first, last]` range of passage ids. Empty iff `first >
/// last`, which is exactly how a zero-text-bearing-pages PDF is recorded:
/// `passage_id_range = [n, n-1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassageIdRange {
    pub first: u64,
    pub last: u64,
}

impl PassageIdRange {
    pub fn empty_at(next_id: u64) -> Self {
        Self {
            first: next_id,
            last: next_id.wrapping_sub(1),
        }
    }

    pub fn len(&self) -> u64 {
        if self.last < self.first {
            0
        } else {
            self.last - self.first + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        !self.is_empty() && id >= self.first && id <= self.last
    }
}

/// A passage: the atomic unit of retrieval, a fixed-size text window
/// from one PDF page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: PassageId,
    pub source_path: String,
    pub page_number: u32,
    pub chunk_index: u32,
    pub text: String,
}

/// Lifecycle status of a source file within the Catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Pending,
    Indexed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Indexed => "indexed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "indexed" => Some(FileStatus::Indexed),
            "failed" => Some(FileStatus::Failed),
            _ => None,
        }
    }
}

/// Per-source-file state tracked by the Catalogue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub source_path: String,
    pub content_hash: String,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
    pub passage_id_range: PassageIdRange,
    pub status: FileStatus,
}

/// Aggregate counts exposed by the Catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub passages: u64,
    pub files: u64,
}

/// A point-in-time generation token, bumped at every file-commit boundary.
/// Lets a caller assert it observed a consistent view across the
/// Catalogue, Vector Index, and Lexical Index without re-deriving it
/// from three separate counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Snapshot(pub u64);

/// Summary surfaced for the out-of-scope `/status` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub passages: u64,
    pub files: u64,
    pub vectors_trained: bool,
    pub degraded_capable: bool,
}

/// A candidate page handed to the Text Filter (C1), before chunking.
#[derive(Debug, Clone)]
pub struct PageCandidate {
    pub page_number: u32,
    pub text: String,
}

/// Why the Text Filter dropped a page. Not part of the spec's contract
/// (which only requires keep/drop); carried so the Driver's per-file
/// report can say why a page was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    TooShort,
    NonJapaneseRatio,
    TableOfContents,
    FigureIndex,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DropReason::TooShort => "fewer than 50 non-whitespace characters",
            DropReason::NonJapaneseRatio => "non-Japanese character ratio exceeds 0.7",
            DropReason::TableOfContents => "looks like a table of contents",
            DropReason::FigureIndex => "looks like a figure/table directory",
        };
        f.write_str(s)
    }
}

/// The Text Filter's verdict on one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterVerdict {
    pub keep: bool,
    pub reason: Option<DropReason>,
}

impl FilterVerdict {
    pub fn keep() -> Self {
        Self { keep: true, reason: None }
    }

    pub fn drop_for(reason: DropReason) -> Self {
        Self { keep: false, reason: Some(reason) }
    }
}

/// A fixed-size passage window produced by the Extractor's sliding window
/// over one page's surviving text. Chunks never cross page boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub page_number: u32,
    pub chunk_index: u32,
    pub text: String,
}

/// A single PDF queued for (re)indexing.
#[derive(Debug, Clone)]
pub struct PendingFile {
    pub path: PathBuf,
    pub content_hash: String,
}

/// Search mode requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Vector,
    Hybrid,
    HybridRerank,
}

/// One hydrated, ranked result returned by the Hybrid Searcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: PassageId,
    pub source: String,
    pub page: u32,
    pub score: f32,
    pub text: String,
    pub snippet: String,
}

/// Per-stage wall-clock timings for one query, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub vector_ms: u64,
    pub bm25_ms: u64,
    pub rerank_ms: u64,
    pub total_ms: u64,
}

/// Full response to one `search` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub degraded: bool,
    pub timings_ms: StageTimings,
}
