//! C2 — Extractor.
//!
//! Reads a PDF (via [`crate::pdf`]), filters pages through C1
//! ([`crate::text_filter`]), then slides a fixed window over each
//! surviving page's text to produce [`Chunk`]s. Chunking is token-
//! approximate: a 400-character window with 50-character overlap,
//! measured in `char`s (not bytes, so multi-byte Japanese text isn't
//! sliced mid-codepoint), never crossing a page boundary.

use std::path::Path;

use crate::config::ExtractionConfig;
use crate::error::ExtractionError;
use crate::text_filter;
use crate::types::{Chunk, PageCandidate};

/// Extracts pages surviving C1, in page order. A whole-file failure
/// (unreadable or encrypted PDF) surfaces as [`ExtractionError`]; a
/// single unreadable page is logged and skipped by [`crate::pdf`] itself,
/// not here.
pub fn extract_kept_pages(path: &Path) -> Result<Vec<(u32, String)>, ExtractionError> {
    let pages = crate::pdf::extract_pages(path)?;
    Ok(filter_pages(pages))
}

pub fn extract_kept_pages_from_bytes(data: Vec<u8>) -> Result<Vec<(u32, String)>, ExtractionError> {
    let pages = crate::pdf::extract_pages_from_bytes(data)?;
    Ok(filter_pages(pages))
}

fn filter_pages(pages: Vec<(u32, String)>) -> Vec<(u32, String)> {
    pages
        .into_iter()
        .filter_map(|(page_number, text)| {
            let verdict = text_filter::evaluate(&PageCandidate { page_number, text: text.clone() });
            if verdict.keep {
                Some((page_number, text))
            } else {
                tracing::debug!(
                    page = page_number,
                    reason = %verdict.reason.expect("drop verdict carries a reason"),
                    "dropping page"
                );
                None
            }
        })
        .collect()
}

/// Slides a fixed window over `(page_number, text)` pairs, yielding
/// [`Chunk`]s in page, then chunk-index, order. A page shorter than the
/// window produces exactly one chunk.
pub fn chunk_pages<'a, I>(pages: I, config: &ExtractionConfig) -> Vec<Chunk>
where
    I: IntoIterator<Item = &'a (u32, String)>,
{
    let mut out = Vec::new();
    for (page_number, text) in pages {
        out.extend(chunk_page(*page_number, text, config));
    }
    out
}

fn chunk_page(page_number: u32, text: &str, config: &ExtractionConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let window = config.chunk_window.max(1);
    let overlap = config.chunk_overlap.min(window.saturating_sub(1));
    let stride = window - overlap;

    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= window {
        return vec![Chunk {
            page_number,
            chunk_index: 0,
            text: chars.into_iter().collect(),
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut chunk_index = 0u32;
    while start < chars.len() {
        let end = (start + window).min(chars.len());
        let slice: String = chars[start..end].iter().collect();
        chunks.push(Chunk {
            page_number,
            chunk_index,
            text: slice,
        });
        if end == chars.len() {
            break;
        }
        start += stride;
        chunk_index += 1;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ExtractionConfig {
        ExtractionConfig::default()
    }

    #[test]
    fn short_page_produces_one_chunk() {
        let pages = vec![(1u32, "短いテキスト".to_string())];
        let chunks = chunk_pages(&pages, &cfg());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "短いテキスト");
    }

    #[test]
    fn long_page_slides_with_overlap() {
        let text: String = (0..1000).map(|i| char::from_u32(0x3042 + (i % 10)).unwrap()).collect();
        let pages = vec![(1u32, text.clone())];
        let chunks = chunk_pages(&pages, &cfg());
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= cfg().chunk_window);
        }
        // Overlap: the tail of chunk 0 should reappear at the head of chunk 1.
        let tail: String = chunks[0].text.chars().rev().take(50).collect::<Vec<_>>().into_iter().rev().collect();
        let head: String = chunks[1].text.chars().take(50).collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn chunks_never_cross_page_boundaries() {
        let pages = vec![
            (1u32, "a".repeat(500)),
            (2u32, "b".repeat(500)),
        ];
        let chunks = chunk_pages(&pages, &cfg());
        assert!(chunks.iter().all(|c| c.page_number == 1 || c.page_number == 2));
        assert!(chunks.iter().filter(|c| c.page_number == 1).all(|c| c.text.chars().all(|ch| ch == 'a')));
        assert!(chunks.iter().filter(|c| c.page_number == 2).all(|c| c.text.chars().all(|ch| ch == 'b')));
    }

    #[test]
    fn empty_page_produces_no_chunks() {
        let pages = vec![(1u32, String::new())];
        let chunks = chunk_pages(&pages, &cfg());
        assert!(chunks.is_empty());
    }

    #[test]
    fn chunk_indices_restart_per_page() {
        let long = "あ".repeat(900);
        let pages = vec![(1u32, long.clone()), (2u32, long)];
        let chunks = chunk_pages(&pages, &cfg());
        let page1_indices: Vec<u32> = chunks.iter().filter(|c| c.page_number == 1).map(|c| c.chunk_index).collect();
        let page2_indices: Vec<u32> = chunks.iter().filter(|c| c.page_number == 2).map(|c| c.chunk_index).collect();
        assert_eq!(page1_indices.first(), Some(&0));
        assert_eq!(page2_indices.first(), Some(&0));
    }

    proptest::proptest! {
        /// For arbitrary page lengths, chunking never exceeds the configured
        /// window and never crosses the one page it was given.
        #[test]
        fn chunk_never_exceeds_window_for_arbitrary_length(len in 0usize..2000) {
            let text: String = (0..len).map(|i| char::from_u32(0x3042 + (i % 20) as u32).unwrap()).collect();
            let pages = vec![(1u32, text)];
            let chunks = chunk_pages(&pages, &cfg());
            for c in &chunks {
                proptest::prop_assert!(c.text.chars().count() <= cfg().chunk_window);
                proptest::prop_assert_eq!(c.page_number, 1);
            }
        }
    }
}
