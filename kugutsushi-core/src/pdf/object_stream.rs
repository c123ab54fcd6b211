//! Compressed object streams (`/Type /ObjStm`, PDF 1.5+).
//!
//! A single stream can pack many small indirect objects (commonly font and
//! page-tree dictionaries) to save space. The stream body starts with `/N`
//! pairs of `(object_number, relative_offset)` followed by `/First` bytes of
//! padding, then the object bodies themselves, back to back.

use crate::error::ExtractionError;

use super::objects::{ObjectParser, PdfObject, PdfStream};

pub struct ObjectStream {
    objects: Vec<(u32, PdfObject)>,
}

impl ObjectStream {
    pub fn parse(stream: &PdfStream) -> Result<Self, ExtractionError> {
        let data = stream.decode()?;
        let n = stream
            .dict
            .get("N")
            .and_then(PdfObject::as_integer)
            .ok_or_else(|| ExtractionError::Malformed("object stream missing /N".into()))?
            as usize;
        let first = stream
            .dict
            .get("First")
            .and_then(PdfObject::as_integer)
            .ok_or_else(|| ExtractionError::Malformed("object stream missing /First".into()))?
            as usize;

        let mut header = ObjectParser::new(&data, 0);
        let mut pairs = Vec::with_capacity(n);
        for _ in 0..n {
            let obj_num = match header.parse_object()? {
                PdfObject::Integer(v) => v as u32,
                other => {
                    return Err(ExtractionError::Malformed(format!(
                        "expected object number in ObjStm header, got {other:?}"
                    )))
                }
            };
            let rel_offset = match header.parse_object()? {
                PdfObject::Integer(v) => v as usize,
                other => {
                    return Err(ExtractionError::Malformed(format!(
                        "expected offset in ObjStm header, got {other:?}"
                    )))
                }
            };
            pairs.push((obj_num, rel_offset));
        }

        let mut objects = Vec::with_capacity(n);
        for (obj_num, rel_offset) in pairs {
            let abs = first + rel_offset;
            if abs >= data.len() {
                continue;
            }
            let mut p = ObjectParser::new(&data, abs);
            let obj = p.parse_object()?;
            objects.push((obj_num, obj));
        }

        Ok(Self { objects })
    }

    pub fn get(&self, index: u32) -> Option<&PdfObject> {
        self.objects.get(index as usize).map(|(_, obj)| obj)
    }
}
