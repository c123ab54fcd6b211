//! Error taxonomy for the retrieval core.
//!
//! Every fallible operation in this crate returns [`Result`]. Variants map
//! directly onto the error taxonomy used throughout the design: extraction
//! failures are per-file recoverable, embedder/index-add failures are
//! per-batch recoverable, and index corruption is always fatal.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),

    #[error("reranker error: {0}")]
    Reranker(#[from] RerankerError),

    #[error("index corruption: {0}")]
    IndexCorruption(String),

    #[error("catalogue conflict: {0}")]
    CatalogueConflict(String),

    #[error("query degraded: {0}")]
    QueryDegraded(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while extracting text from a PDF (component C2).
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("malformed PDF structure: {0}")]
    Malformed(String),

    #[error("unsupported cross-reference format: {0}")]
    UnsupportedXref(String),

    #[error("document is encrypted and cannot be read")]
    Encrypted,

    #[error("unsupported stream filter: {0}")]
    UnsupportedFilter(String),

    #[error("invalid page number: {0}")]
    InvalidPage(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the embedder collaborator (out of scope: implementation).
#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("embedder call failed: {0}")]
    CallFailed(String),

    #[error("embedder timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("embedder returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("embedder returned a vector of dimension {got}, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Errors raised by the reranker collaborator (out of scope: implementation).
#[derive(Error, Debug)]
pub enum RerankerError {
    #[error("reranker call failed: {0}")]
    CallFailed(String),

    #[error("reranker timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extraction_error_converts_into_core_error() {
        let err: CoreError = ExtractionError::Encrypted.into();
        assert!(matches!(err, CoreError::Extraction(ExtractionError::Encrypted)));
        assert_eq!(err.to_string(), "extraction error: document is encrypted and cannot be read");
    }

    #[test]
    fn embedder_count_mismatch_displays_both_numbers() {
        let err = EmbedderError::CountMismatch { expected: 4, got: 3 };
        assert_eq!(err.to_string(), "embedder returned 3 vectors for 4 inputs");
    }

    #[test]
    fn io_error_converts_into_core_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
