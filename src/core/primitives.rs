use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Indirect object reference (`num gen R`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    pub num: u32,
    pub generation: u32,
}

impl Ref {
    pub fn new(num: u32, generation: u32) -> Self {
        Ref { num, generation }
    }

    /// Identifier used for resource ids and cache keys, e.g. `12R` or `12R3`.
    pub fn key(&self) -> String {
        if self.generation == 0 {
            format!("{}R", self.num)
        } else {
            format!("{}R{}", self.num, self.generation)
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} R", self.num, self.generation)
    }
}

/// PDF dictionary. Insertion order is preserved so that dumps and
/// diagnostics match the file.
pub type Dict = IndexMap<String, PDFObject>;

/// A stream object: its dictionary plus the undecoded payload.
///
/// `raw` is a cheap slice of the loaded source bytes. Decoded data is never
/// stored here; see `ObjectStore::get_stream_bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamObject {
    pub dict: Dict,
    pub raw: Bytes,
    /// Absolute offset of the payload in the file (0 for inline images).
    pub offset: usize,
}

impl StreamObject {
    pub fn new(dict: Dict, raw: impl Into<Bytes>, offset: usize) -> Self {
        StreamObject {
            dict,
            raw: raw.into(),
            offset,
        }
    }

    pub fn get(&self, key: &str) -> Option<&PDFObject> {
        self.dict.get(key)
    }
}

/// PDF object types (ISO 32000-1, section 7.3).
///
/// `EOF` and `Command` only appear while parsing; they never end up inside
/// resolved objects.
#[derive(Debug, Clone, PartialEq)]
pub enum PDFObject {
    /// Null value
    Null,

    /// Boolean value
    Boolean(bool),

    /// Numeric value (integers and reals)
    Number(f64),

    /// String value (from literal strings like (hello))
    String(Vec<u8>),

    /// Hex string value (from hex strings like <48656c6c6f>)
    HexString(Vec<u8>),

    /// Name value (from /Name)
    Name(String),

    /// Array of objects
    Array(Vec<PDFObject>),

    /// Dictionary (key-value pairs)
    Dictionary(Dict),

    /// Stream object (dictionary + undecoded payload)
    Stream(Box<StreamObject>),

    /// Indirect object reference (like "5 0 R")
    Ref(Ref),

    /// End of file marker
    EOF,

    /// Command/operator (like 'q', 'Q', 'cm', 'Tj')
    Command(String),
}

impl PDFObject {
    /// Returns true if this object is the EOF marker.
    pub fn is_eof(&self) -> bool {
        matches!(self, PDFObject::EOF)
    }

    /// Returns true if this object is null.
    pub fn is_null(&self) -> bool {
        matches!(self, PDFObject::Null)
    }

    /// Returns true if this object is the given command/keyword.
    pub fn is_command(&self, cmd: &str) -> bool {
        matches!(self, PDFObject::Command(command) if command == cmd)
    }

    pub fn is_name(&self, name: &str) -> bool {
        matches!(self, PDFObject::Name(n) if n == name)
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            PDFObject::Name(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PDFObject::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Integer view of a number; fractional values are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_number().map(|n| n as i64)
    }

    /// Non-negative integer view of a number.
    pub fn as_usize(&self) -> Option<usize> {
        match self.as_number() {
            Some(n) if n >= 0.0 && n.is_finite() => Some(n as usize),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PDFObject::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Raw bytes of a literal or hex string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PDFObject::String(s) | PDFObject::HexString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PDFObject]> {
        match self {
            PDFObject::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Dictionary of a dictionary or stream object.
    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            PDFObject::Dictionary(dict) => Some(dict),
            PDFObject::Stream(stream) => Some(&stream.dict),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamObject> {
        match self {
            PDFObject::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn as_indirect(&self) -> Option<Ref> {
        match self {
            PDFObject::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// Looks up a key if this is a dictionary or stream.
    pub fn get(&self, key: &str) -> Option<&PDFObject> {
        self.as_dict().and_then(|dict| dict.get(key))
    }

    /// `/Type` of a dictionary or stream.
    pub fn type_name(&self) -> Option<&str> {
        self.get("Type").and_then(PDFObject::as_name)
    }

    /// Short description of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            PDFObject::Null => "null",
            PDFObject::Boolean(_) => "boolean",
            PDFObject::Number(_) => "number",
            PDFObject::String(_) => "string",
            PDFObject::HexString(_) => "hex string",
            PDFObject::Name(_) => "name",
            PDFObject::Array(_) => "array",
            PDFObject::Dictionary(_) => "dictionary",
            PDFObject::Stream(_) => "stream",
            PDFObject::Ref(_) => "reference",
            PDFObject::EOF => "end of file",
            PDFObject::Command(_) => "command",
        }
    }

    /// Reads a numeric array such as a `/MediaBox` or `/Matrix`.
    ///
    /// Returns `None` unless the array has exactly `N` numbers.
    pub fn as_number_array<const N: usize>(&self) -> Option<[f64; N]> {
        let items = self.as_array()?;
        if items.len() != N {
            return None;
        }
        let mut out = [0.0; N];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = item.as_number()?;
        }
        Some(out)
    }
}

impl From<Ref> for PDFObject {
    fn from(r: Ref) -> Self {
        PDFObject::Ref(r)
    }
}

impl From<f64> for PDFObject {
    fn from(n: f64) -> Self {
        PDFObject::Number(n)
    }
}

impl From<Dict> for PDFObject {
    fn from(dict: Dict) -> Self {
        PDFObject::Dictionary(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_display_and_key() {
        let r = Ref::new(12, 0);
        assert_eq!(r.to_string(), "12 0 R");
        assert_eq!(r.key(), "12R");
        assert_eq!(Ref::new(7, 2).key(), "7R2");
    }

    #[test]
    fn test_dict_accessors() {
        let mut dict = Dict::new();
        dict.insert("Type".into(), PDFObject::Name("Page".into()));
        dict.insert(
            "MediaBox".into(),
            PDFObject::Array(vec![0.0.into(), 0.0.into(), 612.0.into(), 792.0.into()]),
        );
        let obj = PDFObject::Dictionary(dict);

        assert_eq!(obj.type_name(), Some("Page"));
        assert_eq!(
            obj.get("MediaBox").and_then(|b| b.as_number_array::<4>()),
            Some([0.0, 0.0, 612.0, 792.0])
        );
        assert_eq!(
            obj.get("MediaBox").and_then(|b| b.as_number_array::<6>()),
            None
        );
    }

    #[test]
    fn test_stream_exposes_dict() {
        let mut dict = Dict::new();
        dict.insert("Length".into(), PDFObject::Number(3.0));
        let obj = PDFObject::Stream(Box::new(StreamObject::new(dict, b"abc".to_vec(), 40)));

        assert_eq!(obj.get("Length").and_then(PDFObject::as_usize), Some(3));
        assert_eq!(obj.as_stream().map(|s| s.raw.as_ref()), Some(&b"abc"[..]));
        assert_eq!(obj.kind(), "stream");
    }
}
