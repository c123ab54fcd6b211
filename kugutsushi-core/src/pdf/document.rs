//! High-level document access: open a file, resolve indirect references,
//! and walk the page tree.
//!
//! Mirrors the teacher library's `PdfReader::open` / `PdfDocument::new`
//! split: `PdfReader` owns the raw bytes and the resolved cross-reference
//! table, `PdfDocument` wraps it with page-tree navigation.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ExtractionError;

use super::object_stream::ObjectStream;
use super::objects::{ObjectParser, PdfDictionary, PdfObject};
use super::xref::{find_startxref, parse_xref_chain, XrefEntry, XrefTable};

pub struct PdfReader {
    data: Vec<u8>,
    xref: XrefTable,
    trailer: PdfDictionary,
    object_stream_cache: std::cell::RefCell<HashMap<u32, ObjectStream>>,
}

impl PdfReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ExtractionError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, ExtractionError> {
        if !data.starts_with(b"%PDF-") {
            return Err(ExtractionError::Malformed("missing %PDF- header".into()));
        }
        let startxref = find_startxref(&data)?;
        let (xref, trailer) = parse_xref_chain(&data, startxref)?;

        if trailer.contains_key("Encrypt") {
            return Err(ExtractionError::Encrypted);
        }

        Ok(Self {
            data,
            xref,
            trailer,
            object_stream_cache: std::cell::RefCell::new(HashMap::new()),
        })
    }

    pub fn trailer(&self) -> &PdfDictionary {
        &self.trailer
    }

    /// Resolves an indirect reference to its underlying object. References
    /// to references are followed transitively; the spec's object graph is
    /// a forest in practice, but we bound recursion defensively.
    pub fn resolve(&self, obj: &PdfObject) -> Result<PdfObject, ExtractionError> {
        self.resolve_depth(obj, 0)
    }

    fn resolve_depth(&self, obj: &PdfObject, depth: u32) -> Result<PdfObject, ExtractionError> {
        if depth > 32 {
            return Err(ExtractionError::Malformed("reference chain too deep".into()));
        }
        match obj {
            PdfObject::Reference(num, _gen) => {
                let resolved = self.get_object(*num)?;
                self.resolve_depth(&resolved, depth + 1)
            }
            other => Ok(other.clone()),
        }
    }

    fn get_object(&self, obj_num: u32) -> Result<PdfObject, ExtractionError> {
        match self.xref.get(obj_num) {
            Some(XrefEntry::Offset(offset)) => self.parse_object_at(offset as usize),
            Some(XrefEntry::InStream { stream_obj, index }) => {
                self.get_from_object_stream(stream_obj, index)
            }
            None => Err(ExtractionError::Malformed(format!(
                "object {obj_num} not found in cross-reference table"
            ))),
        }
    }

    fn parse_object_at(&self, offset: usize) -> Result<PdfObject, ExtractionError> {
        if offset >= self.data.len() {
            return Err(ExtractionError::Malformed("object offset out of range".into()));
        }
        let mut parser = ObjectParser::new(&self.data, offset);
        let _obj_num = parser.parse_object()?; // N
        let _gen = parser.parse_object()?; // G
        let pos = skip_ws(&self.data, parser.pos());
        if !self.data[pos..].starts_with(b"obj") {
            return Err(ExtractionError::Malformed("expected 'obj' keyword".into()));
        }
        let mut parser = ObjectParser::new(&self.data, pos + 3);
        parser.parse_object()
    }

    fn get_from_object_stream(
        &self,
        stream_obj: u32,
        index: u32,
    ) -> Result<PdfObject, ExtractionError> {
        if !self.object_stream_cache.borrow().contains_key(&stream_obj) {
            let obj = self.get_object(stream_obj)?;
            let stream = match obj {
                PdfObject::Stream(s) => s,
                _ => {
                    return Err(ExtractionError::Malformed(format!(
                        "object {stream_obj} is not a stream"
                    )))
                }
            };
            let parsed = ObjectStream::parse(&stream)?;
            self.object_stream_cache
                .borrow_mut()
                .insert(stream_obj, parsed);
        }
        self.object_stream_cache
            .borrow()
            .get(&stream_obj)
            .and_then(|s| s.get(index))
            .cloned()
            .ok_or_else(|| {
                ExtractionError::Malformed(format!(
                    "object stream {stream_obj} has no entry {index}"
                ))
            })
    }
}

fn skip_ws(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() && (data[pos] as char).is_whitespace() {
        pos += 1;
    }
    pos
}

/// One leaf of the page tree, flattened and with inheritable attributes
/// (`/Resources`) already resolved.
pub struct ParsedPage {
    pub dict: PdfDictionary,
    pub resources: Option<PdfDictionary>,
}

impl ParsedPage {
    /// Content stream bytes, concatenated across a `/Contents` array per
    /// ISO 32000-1 §7.8.2 (multiple streams form one logical stream, joined
    /// by whitespace so operators never merge across a boundary).
    pub fn content_bytes(&self, reader: &PdfReader) -> Result<Vec<u8>, ExtractionError> {
        let contents = self
            .dict
            .get("Contents")
            .ok_or_else(|| ExtractionError::Malformed("page missing /Contents".into()))?;
        let resolved = reader.resolve(contents)?;
        let mut out = Vec::new();
        match resolved {
            PdfObject::Stream(s) => out.extend(s.decode()?),
            PdfObject::Array(items) => {
                for item in items {
                    let resolved_item = reader.resolve(&item)?;
                    if let PdfObject::Stream(s) = resolved_item {
                        out.extend(s.decode()?);
                        out.push(b'\n');
                    }
                }
            }
            _ => return Err(ExtractionError::Malformed("/Contents is not a stream".into())),
        }
        Ok(out)
    }
}

pub struct PdfDocument {
    reader: PdfReader,
    pages: Vec<PdfDictionary>,
}

impl PdfDocument {
    pub fn new(reader: PdfReader) -> Result<Self, ExtractionError> {
        let root_ref = reader
            .trailer()
            .get("Root")
            .ok_or_else(|| ExtractionError::Malformed("trailer missing /Root".into()))?;
        let catalog = reader.resolve(root_ref)?;
        let catalog = catalog
            .as_dict()
            .ok_or_else(|| ExtractionError::Malformed("/Root is not a dictionary".into()))?
            .clone();
        let pages_ref = catalog
            .get("Pages")
            .ok_or_else(|| ExtractionError::Malformed("catalog missing /Pages".into()))?;

        let mut pages = Vec::new();
        let mut visited = std::collections::HashSet::new();
        collect_pages(&reader, pages_ref, None, &mut pages, &mut visited)?;

        Ok(Self { reader, pages })
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn get_page(&self, index: u32) -> Result<ParsedPage, ExtractionError> {
        let dict = self
            .pages
            .get(index as usize)
            .ok_or(ExtractionError::InvalidPage(index))?
            .clone();
        let resources = match dict.get("Resources") {
            Some(obj) => self.reader.resolve(obj)?.as_dict().cloned(),
            None => None,
        };
        Ok(ParsedPage { dict, resources })
    }

    pub fn reader(&self) -> &PdfReader {
        &self.reader
    }
}

/// Depth-first walk of the page tree, inheriting `/Resources` from parent
/// nodes down to leaves per ISO 32000-1 §7.7.3.4.
fn collect_pages(
    reader: &PdfReader,
    node_ref: &PdfObject,
    inherited_resources: Option<PdfObject>,
    out: &mut Vec<PdfDictionary>,
    visited: &mut std::collections::HashSet<(u32, u16)>,
) -> Result<(), ExtractionError> {
    if let Some(key) = node_ref.as_reference() {
        if !visited.insert(key) {
            return Ok(()); // cyclic page tree; ignore the repeat
        }
    }
    let node = reader.resolve(node_ref)?;
    let dict = node
        .as_dict()
        .ok_or_else(|| ExtractionError::Malformed("page tree node is not a dictionary".into()))?
        .clone();

    let resources = dict
        .get("Resources")
        .cloned()
        .or(inherited_resources);

    match dict.get_type() {
        Some("Pages") => {
            let kids = dict
                .get("Kids")
                .and_then(PdfObject::as_array)
                .ok_or_else(|| ExtractionError::Malformed("/Pages missing /Kids".into()))?;
            for kid in kids {
                collect_pages(reader, kid, resources.clone(), out, visited)?;
            }
        }
        _ => {
            let mut leaf = dict;
            if !leaf.contains_key("Resources") {
                if let Some(r) = resources {
                    leaf.insert("Resources".to_string(), r);
                }
            }
            out.push(leaf);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_pdf_with_text(text_ops: &str) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"%PDF-1.4\n");

        let mut offsets = Vec::new();
        offsets.push(0); // placeholder for object 0 (free)

        offsets.push(data.len());
        data.extend_from_slice(b"1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n");

        offsets.push(data.len());
        data.extend_from_slice(b"2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n");

        offsets.push(data.len());
        data.extend_from_slice(
            b"3 0 obj\n<< /Type /Page /Parent 2 0 R /Contents 4 0 R /Resources << >> >>\nendobj\n",
        );

        offsets.push(data.len());
        let content = text_ops.as_bytes();
        data.extend_from_slice(
            format!("4 0 obj\n<< /Length {} >>\nstream\n", content.len()).as_bytes(),
        );
        data.extend_from_slice(content);
        data.extend_from_slice(b"\nendstream\nendobj\n");

        let xref_offset = data.len();
        data.extend_from_slice(b"xref\n0 5\n");
        data.extend_from_slice(b"0000000000 65535 f \n");
        for off in &offsets[1..] {
            data.extend_from_slice(format!("{:010} 00000 n \n", off).as_bytes());
        }
        data.extend_from_slice(b"trailer\n<< /Size 5 /Root 1 0 R >>\n");
        data.extend_from_slice(format!("startxref\n{}\n%%EOF", xref_offset).as_bytes());
        data
    }

    #[test]
    fn opens_minimal_single_page_document() {
        let data = minimal_pdf_with_text("BT /F1 12 Tf (Hello) Tj ET");
        let reader = PdfReader::from_bytes(data).unwrap();
        let doc = PdfDocument::new(reader).unwrap();
        assert_eq!(doc.page_count(), 1);
        let page = doc.get_page(0).unwrap();
        let content = page.content_bytes(doc.reader()).unwrap();
        assert!(String::from_utf8_lossy(&content).contains("Hello"));
    }

    #[test]
    fn rejects_encrypted_documents() {
        let mut data = minimal_pdf_with_text("BT Tj ET");
        // Splice an /Encrypt entry into the trailer for this test.
        let needle = b"/Size 5 /Root 1 0 R";
        let pos = super::super::objects::find_subslice(&data, needle).unwrap();
        let replacement = b"/Size 5 /Root 1 0 R /Encrypt 9 0 R";
        data.splice(pos..pos + needle.len(), replacement.iter().copied());
        let err = PdfReader::from_bytes(data).unwrap_err();
        assert!(matches!(err, ExtractionError::Encrypted));
    }

    #[test]
    fn out_of_range_page_is_an_error() {
        let data = minimal_pdf_with_text("BT ET");
        let reader = PdfReader::from_bytes(data).unwrap();
        let doc = PdfDocument::new(reader).unwrap();
        assert!(matches!(
            doc.get_page(5),
            Err(ExtractionError::InvalidPage(5))
        ));
    }
}
