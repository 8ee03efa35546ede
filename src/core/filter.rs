//! Filter chains: the ordered list of decoders named by a stream's
//! `/Filter` entry, and the registry that maps filter names to decoders.

use super::decode::{self, PredictorParams};
use super::diagnostics::{Diagnostics, WarningKind};
use super::encryption::CipherTransform;
use super::error::{PDFError, PDFResult};
use super::primitives::{Dict, PDFObject};
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

/// A named stream decoder.
pub trait StreamFilter: Send + Sync {
    /// Canonical filter name, e.g. `FlateDecode`.
    fn name(&self) -> &str;

    fn decode(&self, data: &[u8], params: Option<&Dict>) -> PDFResult<Vec<u8>>;

    /// Image codecs end the chain: their input is passed on still encoded.
    fn is_image_codec(&self) -> bool {
        false
    }
}

struct FlateFilter;

impl StreamFilter for FlateFilter {
    fn name(&self) -> &str {
        "FlateDecode"
    }

    fn decode(&self, data: &[u8], params: Option<&Dict>) -> PDFResult<Vec<u8>> {
        let inflated = decode::decode_flate(data)?;
        match PredictorParams::from_params(params) {
            Some(predictor) => decode::apply_predictor(inflated, &predictor),
            None => Ok(inflated),
        }
    }
}

struct LzwFilter;

impl StreamFilter for LzwFilter {
    fn name(&self) -> &str {
        "LZWDecode"
    }

    fn decode(&self, data: &[u8], params: Option<&Dict>) -> PDFResult<Vec<u8>> {
        let early_change = params
            .and_then(|p| p.get("EarlyChange"))
            .and_then(PDFObject::as_i64)
            .unwrap_or(1)
            != 0;
        let decoded = decode::decode_lzw(data, early_change)?;
        match PredictorParams::from_params(params) {
            Some(predictor) => decode::apply_predictor(decoded, &predictor),
            None => Ok(decoded),
        }
    }
}

/// Filter backed by a plain decoding function without parameters.
struct SimpleFilter {
    name: &'static str,
    decode: fn(&[u8]) -> PDFResult<Vec<u8>>,
}

impl StreamFilter for SimpleFilter {
    fn name(&self) -> &str {
        self.name
    }

    fn decode(&self, data: &[u8], _params: Option<&Dict>) -> PDFResult<Vec<u8>> {
        (self.decode)(data)
    }
}

/// `/Crypt` inside a filter list. Decryption already happened before the
/// chain runs, so this only passes the data through.
struct CryptFilter;

impl StreamFilter for CryptFilter {
    fn name(&self) -> &str {
        "Crypt"
    }

    fn decode(&self, data: &[u8], _params: Option<&Dict>) -> PDFResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Image codec left for the renderer.
struct PassThroughCodec(&'static str);

impl StreamFilter for PassThroughCodec {
    fn name(&self) -> &str {
        self.0
    }

    fn decode(&self, data: &[u8], _params: Option<&Dict>) -> PDFResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_image_codec(&self) -> bool {
        true
    }
}

/// Name → decoder table. One registry belongs to one document; callers may
/// register additional filters before opening.
#[derive(Clone)]
pub struct FilterRegistry {
    filters: FxHashMap<String, Arc<dyn StreamFilter>>,
}

impl FilterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        FilterRegistry {
            filters: FxHashMap::default(),
        }
    }

    /// A registry with every built-in filter and the inline-image
    /// abbreviations.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FlateFilter));
        registry.register(Arc::new(LzwFilter));
        registry.register(Arc::new(SimpleFilter {
            name: "ASCIIHexDecode",
            decode: decode::decode_ascii_hex,
        }));
        registry.register(Arc::new(SimpleFilter {
            name: "ASCII85Decode",
            decode: decode::decode_ascii85,
        }));
        registry.register(Arc::new(SimpleFilter {
            name: "RunLengthDecode",
            decode: decode::decode_run_length,
        }));
        registry.register(Arc::new(CryptFilter));
        for codec in ["DCTDecode", "JPXDecode", "JBIG2Decode", "CCITTFaxDecode"] {
            registry.register(Arc::new(PassThroughCodec(codec)));
        }

        for (alias, name) in [
            ("Fl", "FlateDecode"),
            ("AHx", "ASCIIHexDecode"),
            ("A85", "ASCII85Decode"),
            ("LZW", "LZWDecode"),
            ("RL", "RunLengthDecode"),
            ("DCT", "DCTDecode"),
            ("CCF", "CCITTFaxDecode"),
        ] {
            registry.register_alias(alias, name);
        }
        registry
    }

    /// Registers (or replaces) a filter under its own name.
    pub fn register(&mut self, filter: Arc<dyn StreamFilter>) {
        self.filters.insert(filter.name().to_string(), filter);
    }

    /// Makes `alias` resolve to the filter registered as `name`.
    /// Returns false when `name` is unknown.
    pub fn register_alias(&mut self, alias: &str, name: &str) -> bool {
        match self.filters.get(name).cloned() {
            Some(filter) => {
                self.filters.insert(alias.to_string(), filter);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StreamFilter>> {
        self.filters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for FilterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.filters.keys().collect();
        names.sort();
        f.debug_struct("FilterRegistry").field("filters", &names).finish()
    }
}

/// Result of running a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStream {
    pub bytes: Bytes,
    /// Set when the chain stopped at an image codec, e.g. `DCTDecode`.
    pub encoding: Option<String>,
    /// Parameters of that codec.
    pub encoding_params: Option<Dict>,
}

impl DecodedStream {
    pub fn empty() -> Self {
        DecodedStream {
            bytes: Bytes::new(),
            encoding: None,
            encoding_params: None,
        }
    }
}

/// The filters of one stream in application order, each with its
/// `/DecodeParms` entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterChain {
    filters: Vec<(String, Option<Dict>)>,
}

impl FilterChain {
    /// Reads `/Filter` and `/DecodeParms` from a stream dictionary.
    ///
    /// Indirect values must already be resolved; anything that is not a
    /// name is kept as an unnamed entry so that decoding reports it.
    pub fn from_dict(dict: &Dict) -> Self {
        Self::from_entries(dict.get("Filter"), dict.get("DecodeParms"))
    }

    /// Like [`from_dict`](Self::from_dict) but also accepts the abbreviated
    /// `/F` and `/DP` keys of inline images.
    pub fn from_inline_dict(dict: &Dict) -> Self {
        Self::from_entries(
            dict.get("Filter").or_else(|| dict.get("F")),
            dict.get("DecodeParms").or_else(|| dict.get("DP")),
        )
    }

    fn from_entries(filter: Option<&PDFObject>, params: Option<&PDFObject>) -> Self {
        let names: Vec<String> = match filter {
            Some(PDFObject::Name(name)) => vec![name.clone()],
            Some(PDFObject::Array(items)) => items
                .iter()
                .map(|item| match item {
                    PDFObject::Name(name) => name.clone(),
                    other => format!("<{}>", other.kind()),
                })
                .collect(),
            Some(PDFObject::Null) | None => Vec::new(),
            Some(other) => vec![format!("<{}>", other.kind())],
        };

        let param_at = |index: usize| -> Option<Dict> {
            match params? {
                PDFObject::Dictionary(dict) if index == 0 => Some(dict.clone()),
                PDFObject::Array(items) => items.get(index)?.as_dict().cloned(),
                _ => None,
            }
        };

        FilterChain {
            filters: names
                .into_iter()
                .enumerate()
                .map(|(i, name)| (name, param_at(i)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(|(name, _)| name.as_str())
    }

    /// Decrypts `raw` (when a cipher is given) and runs every filter.
    ///
    /// Never fails: an unknown filter records `UnsupportedFilter` and a
    /// failing one `MalformedObject`; both yield empty bytes.
    pub fn decode(
        &self,
        raw: &[u8],
        registry: &FilterRegistry,
        cipher: Option<&CipherTransform>,
        diagnostics: &Diagnostics,
    ) -> DecodedStream {
        let mut data: Cow<'_, [u8]> = match cipher {
            Some(cipher) if !cipher.is_identity() => Cow::Owned(cipher.decrypt_stream(raw)),
            _ => Cow::Borrowed(raw),
        };

        for (name, params) in &self.filters {
            let Some(filter) = registry.get(name) else {
                diagnostics.report(&PDFError::UnsupportedFilter(name.clone()));
                return DecodedStream::empty();
            };
            if filter.is_image_codec() {
                return DecodedStream {
                    bytes: Bytes::from(data.into_owned()),
                    encoding: Some(filter.name().to_string()),
                    encoding_params: params.clone(),
                };
            }
            match filter.decode(&data, params.as_ref()) {
                Ok(out) => data = Cow::Owned(out),
                Err(e) => {
                    diagnostics.warn(
                        WarningKind::MalformedObject,
                        format!("{} failed: {}", name, e.message()),
                    );
                    return DecodedStream::empty();
                }
            }
        }

        DecodedStream {
            bytes: Bytes::from(data.into_owned()),
            encoding: None,
            encoding_params: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn name(n: &str) -> PDFObject {
        PDFObject::Name(n.into())
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_chain_applies_left_to_right() {
        // /Filter [/ASCIIHexDecode /FlateDecode]: hex first, then inflate
        let compressed = zlib(b"0 0 m 10 10 l S");
        let hex: Vec<u8> = hex::encode(&compressed).into_bytes();

        let mut dict = Dict::new();
        dict.insert(
            "Filter".into(),
            PDFObject::Array(vec![name("ASCIIHexDecode"), name("FlateDecode")]),
        );
        let chain = FilterChain::from_dict(&dict);
        assert_eq!(
            chain.names().collect::<Vec<_>>(),
            vec!["ASCIIHexDecode", "FlateDecode"]
        );

        let diagnostics = Diagnostics::new();
        let registry = FilterRegistry::with_builtins();
        let first = chain.decode(&hex, &registry, None, &diagnostics);
        let second = chain.decode(&hex, &registry, None, &diagnostics);
        assert_eq!(first.bytes.as_ref(), b"0 0 m 10 10 l S");
        assert_eq!(first, second);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn test_unknown_filter_yields_empty_with_warning() {
        let mut dict = Dict::new();
        dict.insert("Filter".into(), name("FancyDecode"));
        let diagnostics = Diagnostics::new();

        let out = FilterChain::from_dict(&dict).decode(
            b"data",
            &FilterRegistry::with_builtins(),
            None,
            &diagnostics,
        );
        assert!(out.bytes.is_empty());
        assert!(diagnostics.has(WarningKind::UnsupportedFilter));
    }

    #[test]
    fn test_failing_filter_yields_empty_with_warning() {
        let mut dict = Dict::new();
        dict.insert("Filter".into(), name("FlateDecode"));
        let diagnostics = Diagnostics::new();

        let out = FilterChain::from_dict(&dict).decode(
            b"\xff\xff\xff\xff garbage",
            &FilterRegistry::with_builtins(),
            None,
            &diagnostics,
        );
        assert!(out.bytes.is_empty());
        assert!(diagnostics.has(WarningKind::MalformedObject));
    }

    #[test]
    fn test_image_codec_stops_chain() {
        let mut dict = Dict::new();
        dict.insert(
            "Filter".into(),
            PDFObject::Array(vec![name("AHx"), name("DCT")]),
        );
        let out = FilterChain::from_inline_dict(&dict).decode(
            b"FFD8>",
            &FilterRegistry::with_builtins(),
            None,
            &Diagnostics::new(),
        );
        assert_eq!(out.bytes.as_ref(), &[0xFF, 0xD8]);
        assert_eq!(out.encoding.as_deref(), Some("DCTDecode"));
    }

    #[test]
    fn test_decode_parms_array_with_null() {
        let mut params = Dict::new();
        params.insert("Predictor".into(), PDFObject::Number(12.0));
        let mut dict = Dict::new();
        dict.insert(
            "Filter".into(),
            PDFObject::Array(vec![name("ASCII85Decode"), name("FlateDecode")]),
        );
        dict.insert(
            "DecodeParms".into(),
            PDFObject::Array(vec![PDFObject::Null, PDFObject::Dictionary(params.clone())]),
        );
        let chain = FilterChain::from_dict(&dict);
        assert_eq!(chain.filters[0].1, None);
        assert_eq!(chain.filters[1].1, Some(params));
    }

    #[test]
    fn test_custom_filter_registration() {
        struct Upper;
        impl StreamFilter for Upper {
            fn name(&self) -> &str {
                "UpperDecode"
            }
            fn decode(&self, data: &[u8], _params: Option<&Dict>) -> PDFResult<Vec<u8>> {
                Ok(data.to_ascii_uppercase())
            }
        }

        let mut registry = FilterRegistry::with_builtins();
        registry.register(Arc::new(Upper));
        assert!(registry.register_alias("Up", "UpperDecode"));
        assert!(!registry.register_alias("X", "Missing"));

        let mut dict = Dict::new();
        dict.insert("Filter".into(), name("Up"));
        let out = FilterChain::from_dict(&dict).decode(b"abc", &registry, None, &Diagnostics::new());
        assert_eq!(out.bytes.as_ref(), b"ABC");
    }
}
