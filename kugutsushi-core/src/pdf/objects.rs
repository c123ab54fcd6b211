//! Low-level PDF object model and tokenizer (ISO 32000-1 §7.3).
//!
//! A PDF file is a graph of eight object types: null, boolean, integer, real,
//! string, name, array, dictionary (and its stream variant), plus indirect
//! references between them. This module parses bytes into that model; it
//! does not resolve references or understand document structure — that is
//! [`super::document`]'s job.

use std::collections::HashMap;

use crate::error::ExtractionError;

#[derive(Debug, Clone, PartialEq)]
pub enum PdfObject {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(Vec<u8>),
    Name(String),
    Array(Vec<PdfObject>),
    Dictionary(PdfDictionary),
    Stream(PdfStream),
    Reference(u32, u16),
}

impl PdfObject {
    pub fn as_dict(&self) -> Option<&PdfDictionary> {
        match self {
            PdfObject::Dictionary(d) => Some(d),
            PdfObject::Stream(s) => Some(&s.dict),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PdfObject]> {
        match self {
            PdfObject::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            PdfObject::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PdfObject::Integer(i) => Some(*i),
            PdfObject::Real(r) => Some(*r as i64),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<(u32, u16)> {
        match self {
            PdfObject::Reference(n, g) => Some((*n, *g)),
            _ => None,
        }
    }
}

/// Key-value mapping with PDF name keys. Wraps a `HashMap` rather than
/// aliasing it so lookups can stay string-keyed without re-allocating a
/// `PdfName` wrapper on every access.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PdfDictionary(pub HashMap<String, PdfObject>);

impl PdfDictionary {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&PdfObject> {
        self.0.get(key)
    }

    pub fn get_type(&self) -> Option<&str> {
        self.get("Type").and_then(PdfObject::as_name)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: String, value: PdfObject) {
        self.0.insert(key, value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PdfStream {
    pub dict: PdfDictionary,
    pub raw_data: Vec<u8>,
}

impl PdfStream {
    /// Decodes `raw_data` per the stream's `/Filter` entry(ies).
    ///
    /// Only `FlateDecode` is supported; anything else surfaces as
    /// [`ExtractionError::UnsupportedFilter`] so the caller can skip just
    /// this stream rather than fail the whole document.
    pub fn decode(&self) -> Result<Vec<u8>, ExtractionError> {
        let filters = self.filter_names();
        if filters.is_empty() {
            return Ok(self.raw_data.clone());
        }
        let mut data = self.raw_data.clone();
        for filter in filters {
            data = match filter.as_str() {
                "FlateDecode" | "Fl" => inflate(&data)?,
                other => return Err(ExtractionError::UnsupportedFilter(other.to_string())),
            };
        }
        Ok(data)
    }

    fn filter_names(&self) -> Vec<String> {
        match self.dict.get("Filter") {
            Some(PdfObject::Name(n)) => vec![n.clone()],
            Some(PdfObject::Array(items)) => items
                .iter()
                .filter_map(PdfObject::as_name)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, ExtractionError> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;

    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| ExtractionError::Malformed(format!("FlateDecode failed: {e}")))?;
    Ok(out)
}

/// Recursive-descent parser over a PDF byte slice, positioned at `pos`.
pub struct ObjectParser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ObjectParser<'a> {
    pub fn new(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.peek();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(b) if is_whitespace(b) => {
                    self.pos += 1;
                }
                Some(b'%') => {
                    while let Some(b) = self.peek() {
                        if b == b'\n' || b == b'\r' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn starts_with(&self, needle: &[u8]) -> bool {
        self.data[self.pos..].starts_with(needle)
    }

    /// Parses a single object at the current position, advancing past it.
    pub fn parse_object(&mut self) -> Result<PdfObject, ExtractionError> {
        self.skip_whitespace_and_comments();
        match self.peek() {
            None => Err(ExtractionError::Malformed("unexpected end of object".into())),
            Some(b'/') => self.parse_name(),
            Some(b'(') => self.parse_literal_string(),
            Some(b'<') => {
                if self.starts_with(b"<<") {
                    self.parse_dict_or_stream()
                } else {
                    self.parse_hex_string()
                }
            }
            Some(b'[') => self.parse_array(),
            Some(b't') | Some(b'f') => self.parse_boolean(),
            Some(b'n') => self.parse_null(),
            Some(b) if b == b'+' || b == b'-' || b == b'.' || b.is_ascii_digit() => {
                self.parse_number_or_reference()
            }
            Some(other) => Err(ExtractionError::Malformed(format!(
                "unexpected byte 0x{other:02x} at offset {}",
                self.pos
            ))),
        }
    }

    fn parse_name(&mut self) -> Result<PdfObject, ExtractionError> {
        self.advance(); // '/'
        let mut name = String::new();
        while let Some(b) = self.peek() {
            if is_delimiter(b) || is_whitespace(b) {
                break;
            }
            if b == b'#' && self.pos + 2 < self.data.len() {
                let hex = &self.data[self.pos + 1..self.pos + 3];
                if let Ok(hex_str) = std::str::from_utf8(hex) {
                    if let Ok(byte) = u8::from_str_radix(hex_str, 16) {
                        name.push(byte as char);
                        self.pos += 3;
                        continue;
                    }
                }
            }
            name.push(b as char);
            self.pos += 1;
        }
        Ok(PdfObject::Name(name))
    }

    fn parse_literal_string(&mut self) -> Result<PdfObject, ExtractionError> {
        self.advance(); // '('
        let mut depth = 1;
        let mut out = Vec::new();
        while let Some(b) = self.advance() {
            match b {
                b'\\' => {
                    if let Some(esc) = self.advance() {
                        match esc {
                            b'n' => out.push(b'\n'),
                            b'r' => out.push(b'\r'),
                            b't' => out.push(b'\t'),
                            b'b' => out.push(0x08),
                            b'f' => out.push(0x0c),
                            b'(' | b')' | b'\\' => out.push(esc),
                            b'\r' | b'\n' => {} // line continuation
                            d if d.is_ascii_digit() => {
                                let mut val = (d - b'0') as u32;
                                for _ in 0..2 {
                                    if let Some(d2) = self.peek() {
                                        if d2.is_ascii_digit() {
                                            val = val * 8 + (d2 - b'0') as u32;
                                            self.pos += 1;
                                        } else {
                                            break;
                                        }
                                    }
                                }
                                out.push(val as u8);
                            }
                            other => out.push(other),
                        }
                    }
                }
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    out.push(b);
                }
                other => out.push(other),
            }
        }
        Ok(PdfObject::String(out))
    }

    fn parse_hex_string(&mut self) -> Result<PdfObject, ExtractionError> {
        self.advance(); // '<'
        let mut digits = Vec::new();
        while let Some(b) = self.advance() {
            if b == b'>' {
                break;
            }
            if b.is_ascii_hexdigit() {
                digits.push(b);
            }
        }
        if digits.len() % 2 == 1 {
            digits.push(b'0');
        }
        let mut bytes = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let s = std::str::from_utf8(pair).unwrap_or("00");
            bytes.push(u8::from_str_radix(s, 16).unwrap_or(0));
        }
        Ok(PdfObject::String(bytes))
    }

    fn parse_array(&mut self) -> Result<PdfObject, ExtractionError> {
        self.advance(); // '['
        let mut items = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            if self.peek() == Some(b']') {
                self.advance();
                break;
            }
            if self.peek().is_none() {
                return Err(ExtractionError::Malformed("unterminated array".into()));
            }
            items.push(self.parse_object()?);
        }
        Ok(PdfObject::Array(items))
    }

    fn parse_dict_or_stream(&mut self) -> Result<PdfObject, ExtractionError> {
        self.pos += 2; // '<<'
        let mut dict = PdfDictionary::new();
        loop {
            self.skip_whitespace_and_comments();
            if self.starts_with(b">>") {
                self.pos += 2;
                break;
            }
            if self.peek().is_none() {
                return Err(ExtractionError::Malformed("unterminated dictionary".into()));
            }
            let key = match self.parse_object()? {
                PdfObject::Name(n) => n,
                other => {
                    return Err(ExtractionError::Malformed(format!(
                        "dictionary key must be a name, got {other:?}"
                    )))
                }
            };
            let value = self.parse_object()?;
            dict.insert(key, value);
        }

        self.skip_whitespace_and_comments();
        if self.starts_with(b"stream") {
            self.pos += "stream".len();
            if self.peek() == Some(b'\r') {
                self.pos += 1;
            }
            if self.peek() == Some(b'\n') {
                self.pos += 1;
            }
            let length = dict
                .get("Length")
                .and_then(PdfObject::as_integer)
                .unwrap_or(0) as usize;
            let start = self.pos;
            let mut end = (start + length).min(self.data.len());
            // Some producers write an inaccurate /Length; fall back to scanning
            // for the endstream keyword when the declared length overruns.
            if !self.data[end..].starts_with(b"endstream") {
                if let Some(found) = find_subslice(&self.data[start..], b"endstream") {
                    end = start + found;
                }
            }
            let raw_data = self.data[start..end].to_vec();
            self.pos = end;
            self.skip_whitespace_and_comments();
            if self.starts_with(b"endstream") {
                self.pos += "endstream".len();
            }
            return Ok(PdfObject::Stream(PdfStream { dict, raw_data }));
        }

        Ok(PdfObject::Dictionary(dict))
    }

    fn parse_boolean(&mut self) -> Result<PdfObject, ExtractionError> {
        if self.starts_with(b"true") {
            self.pos += 4;
            Ok(PdfObject::Boolean(true))
        } else if self.starts_with(b"false") {
            self.pos += 5;
            Ok(PdfObject::Boolean(false))
        } else {
            Err(ExtractionError::Malformed("expected boolean".into()))
        }
    }

    fn parse_null(&mut self) -> Result<PdfObject, ExtractionError> {
        if self.starts_with(b"null") {
            self.pos += 4;
            Ok(PdfObject::Null)
        } else {
            Err(ExtractionError::Malformed("expected null".into()))
        }
    }

    /// Numbers and indirect references share a leading-digit grammar:
    /// `12 0 R` is a reference, `12.0` is a real, `12` alone is an integer.
    /// We lex the first number, then look ahead for `<gen> R`.
    fn parse_number_or_reference(&mut self) -> Result<PdfObject, ExtractionError> {
        let start = self.pos;
        let first = self.lex_number()?;

        if let PdfObject::Integer(n) = first {
            let checkpoint = self.pos;
            self.skip_whitespace_and_comments();
            let gen_start = self.pos;
            if let Some(b) = self.peek() {
                if b.is_ascii_digit() {
                    let gen_text_start = self.pos;
                    while let Some(b) = self.peek() {
                        if b.is_ascii_digit() {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                    let gen_text = std::str::from_utf8(&self.data[gen_text_start..self.pos])
                        .unwrap_or("0");
                    if let Ok(gen) = gen_text.parse::<u16>() {
                        self.skip_whitespace_and_comments();
                        if self.peek() == Some(b'R')
                            && self
                                .data
                                .get(self.pos + 1)
                                .map(|b| is_delimiter(*b) || is_whitespace(*b))
                                .unwrap_or(true)
                        {
                            self.pos += 1;
                            return Ok(PdfObject::Reference(n as u32, gen));
                        }
                    }
                }
            }
            let _ = gen_start;
            self.pos = checkpoint;
        }
        let _ = start;
        Ok(first)
    }

    fn lex_number(&mut self) -> Result<PdfObject, ExtractionError> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'+') | Some(b'-')) {
            self.pos += 1;
        }
        let mut is_real = false;
        while let Some(b) = self.peek() {
            if b.is_ascii_digit() {
                self.pos += 1;
            } else if b == b'.' {
                is_real = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| ExtractionError::Malformed("invalid number".into()))?;
        if is_real {
            text.parse::<f64>()
                .map(PdfObject::Real)
                .map_err(|_| ExtractionError::Malformed(format!("invalid real number: {text}")))
        } else {
            text.parse::<i64>()
                .map(PdfObject::Integer)
                .map_err(|_| ExtractionError::Malformed(format!("invalid integer: {text}")))
        }
    }
}

fn is_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0c | 0x00)
}

fn is_delimiter(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> PdfObject {
        let mut p = ObjectParser::new(src.as_bytes(), 0);
        p.parse_object().unwrap()
    }

    #[test]
    fn parses_integers_and_reals() {
        assert_eq!(parse("42"), PdfObject::Integer(42));
        assert_eq!(parse("-3.14"), PdfObject::Real(-3.14));
    }

    #[test]
    fn parses_names_with_hex_escapes() {
        assert_eq!(parse("/Name#20With#20Spaces"), PdfObject::Name("Name With Spaces".into()));
    }

    #[test]
    fn parses_literal_strings_with_escapes() {
        assert_eq!(parse("(hi\\n)"), PdfObject::String(b"hi\n".to_vec()));
        assert_eq!(parse("(nested (parens))"), PdfObject::String(b"nested (parens)".to_vec()));
    }

    #[test]
    fn parses_hex_strings() {
        assert_eq!(parse("<48656C6C6F>"), PdfObject::String(b"Hello".to_vec()));
    }

    #[test]
    fn parses_arrays_and_dictionaries() {
        let obj = parse("[1 2 /Three]");
        assert_eq!(
            obj,
            PdfObject::Array(vec![
                PdfObject::Integer(1),
                PdfObject::Integer(2),
                PdfObject::Name("Three".into()),
            ])
        );

        let obj = parse("<< /Type /Page /Count 3 >>");
        let dict = obj.as_dict().unwrap();
        assert_eq!(dict.get_type(), Some("Page"));
        assert_eq!(dict.get("Count").unwrap().as_integer(), Some(3));
    }

    #[test]
    fn parses_indirect_references() {
        assert_eq!(parse("12 0 R"), PdfObject::Reference(12, 0));
    }

    #[test]
    fn distinguishes_integer_from_reference_lookalike() {
        // A bare integer followed by something that isn't "<gen> R" stays an integer.
        assert_eq!(parse("12 0 obj"), PdfObject::Integer(12));
    }

    #[test]
    fn parses_stream_with_declared_length() {
        let src = b"<< /Length 5 >>\nstream\nhello\nendstream";
        let mut p = ObjectParser::new(src, 0);
        let obj = p.parse_object().unwrap();
        match obj {
            PdfObject::Stream(s) => assert_eq!(s.raw_data, b"hello"),
            other => panic!("expected stream, got {other:?}"),
        }
    }
}
