//! A small, from-scratch, pure-Rust PDF reader: just enough object model,
//! cross-reference resolution, and content-stream interpretation to
//! recover page text for retrieval. Not a general-purpose PDF library —
//! no writing, no graphics, no forms; see [`crate::extractor`] for the
//! page/chunk pipeline built on top of this module.

pub mod cmap;
pub mod content;
pub mod document;
pub mod object_stream;
pub mod objects;
pub mod xref;

use std::collections::HashMap;

use crate::error::ExtractionError;
use cmap::ToUnicodeMap;
use document::{PdfDocument, PdfReader};
use objects::PdfObject;

/// Builds the font-name → `ToUnicode` map table for one page, by walking
/// its `/Resources/Font` dictionary and decoding each font's
/// `/ToUnicode` stream, if present. Fonts without one are simply absent
/// from the returned map; [`content::extract_text`] falls back to a
/// byte-for-byte decode for those.
pub fn page_cmaps(
    reader: &PdfReader,
    resources: Option<&objects::PdfDictionary>,
) -> HashMap<String, ToUnicodeMap> {
    let mut out = HashMap::new();
    let Some(resources) = resources else {
        return out;
    };
    let Some(fonts_ref) = resources.get("Font") else {
        return out;
    };
    let Ok(fonts_obj) = reader.resolve(fonts_ref) else {
        return out;
    };
    let Some(fonts) = fonts_obj.as_dict() else {
        return out;
    };

    for (name, font_ref) in fonts.0.iter() {
        let Ok(font_obj) = reader.resolve(font_ref) else { continue };
        let Some(font_dict) = font_obj.as_dict() else { continue };
        let Some(tu_ref) = font_dict.get("ToUnicode") else { continue };
        let Ok(tu_obj) = reader.resolve(tu_ref) else { continue };
        if let PdfObject::Stream(stream) = tu_obj {
            if let Ok(data) = stream.decode() {
                out.insert(name.clone(), ToUnicodeMap::parse(&data));
            }
        }
    }
    out
}

/// Opens a PDF and yields its per-page raw text, in page order, before any
/// text-filter (C1) verdict is applied. This is the bottom layer of C2;
/// [`crate::extractor`] wraps it with the filter and the chunker.
pub fn extract_pages(path: &std::path::Path) -> Result<Vec<(u32, String)>, ExtractionError> {
    let reader = PdfReader::open(path)?;
    let doc = PdfDocument::new(reader)?;
    extract_pages_from(&doc)
}

pub fn extract_pages_from_bytes(data: Vec<u8>) -> Result<Vec<(u32, String)>, ExtractionError> {
    let reader = PdfReader::from_bytes(data)?;
    let doc = PdfDocument::new(reader)?;
    extract_pages_from(&doc)
}

fn extract_pages_from(doc: &PdfDocument) -> Result<Vec<(u32, String)>, ExtractionError> {
    let mut pages = Vec::with_capacity(doc.page_count() as usize);
    for index in 0..doc.page_count() {
        // A single malformed page must not fail the whole document —
        // individual page failures are logged and skipped.
        match extract_one_page(doc, index) {
            Ok(text) => pages.push((index + 1, text)),
            Err(err) => {
                tracing::warn!(page = index + 1, error = %err, "skipping unreadable page");
            }
        }
    }
    Ok(pages)
}

fn extract_one_page(doc: &PdfDocument, index: u32) -> Result<String, ExtractionError> {
    let page = doc.get_page(index)?;
    let content = page.content_bytes(doc.reader())?;
    let cmaps = page_cmaps(doc.reader(), page.resources.as_ref());
    content::extract_text(&content, &cmaps)
}
