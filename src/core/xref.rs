use super::base_stream::BaseStream;
use super::diagnostics::{Diagnostics, WarningKind};
use super::error::{PDFError, PDFResult};
use super::filter::{FilterChain, FilterRegistry};
use super::lexer::Lexer;
use super::parser::{Parser, find_subslice};
use super::primitives::{Dict, PDFObject, Ref};
use super::stream::Stream;
use bytes::Bytes;
use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};

/// How far from the end of the file `startxref` is searched for.
pub const STARTXREF_SEARCH_WINDOW: usize = 1024;

/// Trailer keys that describe a single section and are not merged.
const SECTION_KEYS: &[&str] = &[
    "Prev", "XRefStm", "Type", "W", "Index", "Length", "Filter", "DecodeParms", "Size",
];

/// Cross-reference table entry.
///
/// Each entry describes where to find an indirect object in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRefEntry {
    /// Free entry - object number is available for reuse
    Free { next_free: u64, generation: u32 },

    /// Uncompressed entry - object is stored at the given offset
    Uncompressed { offset: usize, generation: u32 },

    /// Compressed entry - object is stored in an object stream
    Compressed { obj_stream_num: u32, index: u32 },
}

impl XRefEntry {
    /// Returns true if this entry is free.
    pub fn is_free(&self) -> bool {
        matches!(self, XRefEntry::Free { .. })
    }

    /// Returns the generation number for this entry.
    pub fn generation(&self) -> u32 {
        match self {
            XRefEntry::Free { generation, .. } => *generation,
            XRefEntry::Uncompressed { generation, .. } => *generation,
            XRefEntry::Compressed { .. } => 0,
        }
    }
}

/// Where a section came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Classic `xref` table, possibly with a `/XRefStm` supplement.
    Table,
    /// Cross-reference stream.
    Stream,
    /// Rebuilt by scanning the whole file.
    Reconstructed,
}

/// One cross-reference section with its trailer.
#[derive(Debug, Clone)]
pub struct XRefSection {
    pub kind: SectionKind,
    /// File offset of the section, `None` when reconstructed.
    pub offset: Option<usize>,
    pub entries: FxHashMap<u32, XRefEntry>,
    pub trailer: Dict,
}

/// Cross-reference data for a document.
///
/// Every section of the `/Prev` chain is kept, newest first. A lookup walks
/// the sections in that order and the first non-free entry wins; limiting the
/// walk to older sections answers revision queries.
#[derive(Debug, Clone)]
pub struct XRef {
    /// Newest first.
    sections: Vec<XRefSection>,
    /// Trailer entries merged newest-first.
    trailer: Dict,
    repaired: bool,
}

impl XRef {
    fn from_sections(sections: Vec<XRefSection>, repaired: bool) -> PDFResult<Self> {
        if sections.is_empty() {
            return Err(PDFError::InvalidDocument(
                "No cross-reference sections".to_string(),
            ));
        }
        let mut trailer = Dict::new();
        for section in &sections {
            for (key, value) in &section.trailer {
                if !SECTION_KEYS.contains(&key.as_str()) && !trailer.contains_key(key) {
                    trailer.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(XRef {
            sections,
            trailer,
            repaired,
        })
    }

    /// Trailer entries (`Root`, `Info`, `Encrypt`, `ID`), newest value of each.
    pub fn trailer(&self) -> &Dict {
        &self.trailer
    }

    /// Reference of the document catalog.
    pub fn root(&self) -> Option<Ref> {
        self.trailer.get("Root").and_then(PDFObject::as_indirect)
    }

    /// The first element of the trailer's `/ID` array.
    pub fn file_id(&self) -> Vec<u8> {
        self.trailer
            .get("ID")
            .and_then(PDFObject::as_array)
            .and_then(|ids| ids.first())
            .and_then(PDFObject::as_bytes)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    /// True when the table was rebuilt by scanning the file.
    pub fn is_repaired(&self) -> bool {
        self.repaired
    }

    /// Number of revisions (sections of the `/Prev` chain).
    pub fn revision_count(&self) -> usize {
        self.sections.len()
    }

    pub fn sections(&self) -> &[XRefSection] {
        &self.sections
    }

    /// Entry for `num` in the latest revision.
    pub fn get_entry(&self, num: u32) -> Option<XRefEntry> {
        Self::lookup(&self.sections, num)
    }

    /// Entry for `num` as of `revision` (0 = original file). Revisions past
    /// the newest one answer like the newest.
    pub fn entry_at_revision(&self, num: u32, revision: usize) -> Option<XRefEntry> {
        let newest = self.sections.len() - 1;
        let skip = newest.saturating_sub(revision);
        Self::lookup(&self.sections[skip..], num)
    }

    /// First non-free entry, else the newest free one.
    fn lookup(sections: &[XRefSection], num: u32) -> Option<XRefEntry> {
        let mut free = None;
        for section in sections {
            match section.entries.get(&num) {
                Some(entry) if !entry.is_free() => return Some(*entry),
                Some(entry) if free.is_none() => free = Some(*entry),
                _ => {}
            }
        }
        free
    }

    /// All object numbers with a non-free entry, ascending.
    pub fn object_numbers(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .sections
            .iter()
            .flat_map(|s| s.entries.iter())
            .filter(|(_, entry)| !entry.is_free())
            .map(|(num, _)| *num)
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Rebuilds the table from the complete file.
    ///
    /// Every `N G obj` header is indexed (later ones win), objects inside
    /// object streams are indexed when not defined directly, and the trailer
    /// is taken from the last `trailer` dictionary or cross-reference stream
    /// that names a `/Root`. Without one, an object of `/Type /Catalog`
    /// becomes the root.
    pub fn reconstruct(
        data: &Bytes,
        registry: &FilterRegistry,
        diagnostics: &Diagnostics,
    ) -> PDFResult<XRef> {
        if data.is_empty() {
            return Err(PDFError::InvalidDocument("Empty file".to_string()));
        }

        let mut entries: FxHashMap<u32, XRefEntry> = FxHashMap::default();
        let mut trailers: Vec<Dict> = Vec::new();
        let mut object_streams: Vec<(u32, usize)> = Vec::new();
        let mut catalog: Option<Ref> = None;

        for (reference, offset, body) in scan_object_headers(data) {
            entries.insert(
                reference.num,
                XRefEntry::Uncompressed {
                    offset,
                    generation: reference.generation,
                },
            );
            let head = &data[body..(body + 512).min(data.len())];
            if find_subslice(head, b"/ObjStm").is_some() {
                object_streams.push((reference.num, offset));
            }
            if find_subslice(head, b"/XRef").is_some() {
                if let Ok(PDFObject::Stream(stream)) = parse_object_at(data, offset) {
                    trailers.push(stream.dict);
                }
            }
            if find_subslice(head, b"/Catalog").is_some() {
                catalog = Some(reference);
            }
        }

        let mut search = 0;
        while let Some(found) = find_subslice(&data[search..], b"trailer") {
            let at = search + found + b"trailer".len();
            if let Ok(PDFObject::Dictionary(dict)) = parse_object_at(data, at) {
                trailers.push(dict);
            }
            search = at;
        }

        for (stream_num, offset) in object_streams {
            let Ok(PDFObject::Stream(stream)) = parse_object_at(data, offset) else {
                continue;
            };
            let n = stream.dict.get("N").and_then(PDFObject::as_usize).unwrap_or(0);
            let decoded = FilterChain::from_dict(&stream.dict).decode(
                &stream.raw,
                registry,
                None,
                diagnostics,
            );
            let Ok(header) = read_object_stream_header(&decoded.bytes, n) else {
                continue;
            };
            for (index, (num, _)) in header.into_iter().enumerate() {
                entries.entry(num).or_insert(XRefEntry::Compressed {
                    obj_stream_num: stream_num,
                    index: index as u32,
                });
            }
        }

        let mut trailer = trailers
            .into_iter()
            .rev()
            .find(|t| t.get("Root").and_then(PDFObject::as_indirect).is_some())
            .unwrap_or_default();
        if !trailer.contains_key("Root") {
            let root = catalog.ok_or_else(|| {
                PDFError::InvalidDocument("No catalog found while reconstructing".to_string())
            })?;
            trailer.insert("Root".to_string(), PDFObject::Ref(root));
        }

        info!("Reconstructed cross-reference table with {} objects", entries.len());
        diagnostics.warn(
            WarningKind::XRefRepaired,
            format!("cross-reference table rebuilt, {} objects found", entries.len()),
        );

        XRef::from_sections(
            vec![XRefSection {
                kind: SectionKind::Reconstructed,
                offset: None,
                entries,
                trailer,
            }],
            true,
        )
    }
}

/// Walks the `/Prev` chain one section at a time.
///
/// [`parse_next`](Self::parse_next) only changes state on success, so a
/// `DataMissing` error can be answered by loading the range and calling it
/// again.
#[derive(Debug)]
pub struct XRefLoader {
    queue: Vec<usize>,
    visited: FxHashSet<usize>,
    sections: Vec<XRefSection>,
}

impl XRefLoader {
    pub fn new(startxref: usize) -> Self {
        XRefLoader {
            queue: vec![startxref],
            visited: FxHashSet::default(),
            sections: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.queue.is_empty()
    }

    /// Offset of the section parsed next.
    pub fn next_offset(&self) -> Option<usize> {
        self.queue.first().copied()
    }

    /// Parses the next section of the chain.
    pub fn parse_next(
        &mut self,
        stream: &dyn BaseStream,
        registry: &FilterRegistry,
        diagnostics: &Diagnostics,
    ) -> PDFResult<()> {
        let Some(&offset) = self.queue.first() else {
            return Ok(());
        };

        let mut extra_visited = Vec::new();
        let section = if starts_with_keyword(stream, offset, b"xref")? {
            let mut section = parse_xref_table(stream, offset)?;
            if let Some(stm_offset) = section.trailer.get("XRefStm").and_then(PDFObject::as_usize) {
                if !self.visited.contains(&stm_offset) {
                    let supplement = parse_xref_stream(stream, stm_offset, registry, diagnostics)?;
                    for (num, entry) in supplement.entries {
                        let replace = section.entries.get(&num).is_none_or(XRefEntry::is_free);
                        if replace {
                            section.entries.insert(num, entry);
                        }
                    }
                    extra_visited.push(stm_offset);
                }
            }
            section
        } else {
            parse_xref_stream(stream, offset, registry, diagnostics)?
        };

        self.queue.remove(0);
        self.visited.insert(offset);
        self.visited.extend(extra_visited);

        if let Some(prev) = section.trailer.get("Prev").and_then(PDFObject::as_usize) {
            if self.visited.contains(&prev) {
                warn!("Cross-reference /Prev loop at offset {}, stopping", prev);
            } else {
                self.queue.push(prev);
            }
        }
        debug!(
            "Parsed {:?} cross-reference section at {} ({} entries)",
            section.kind,
            offset,
            section.entries.len()
        );
        self.sections.push(section);
        Ok(())
    }

    pub fn finish(self) -> PDFResult<XRef> {
        XRef::from_sections(self.sections, false)
    }
}

/// Locates `startxref` in the last [`STARTXREF_SEARCH_WINDOW`] bytes and
/// returns the offset it names.
pub fn find_startxref(stream: &dyn BaseStream) -> PDFResult<Option<usize>> {
    let end = stream.end();
    let begin = end.saturating_sub(STARTXREF_SEARCH_WINDOW).max(stream.start());
    let tail = stream.get_byte_range(begin, end)?;

    let Some(found) = tail
        .windows(b"startxref".len())
        .rposition(|w| w == b"startxref")
    else {
        return Ok(None);
    };
    let digits: Vec<u8> = tail[found + b"startxref".len()..]
        .iter()
        .copied()
        .skip_while(u8::is_ascii_whitespace)
        .take_while(u8::is_ascii_digit)
        .collect();
    Ok(std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok()))
}

fn starts_with_keyword(stream: &dyn BaseStream, offset: usize, keyword: &[u8]) -> PDFResult<bool> {
    if offset >= stream.end() {
        return Err(PDFError::MalformedObject(format!(
            "Cross-reference offset {} is past the end of the file",
            offset
        )));
    }
    let window_end = (offset + 64).min(stream.end());
    let window = stream.get_byte_range(offset, window_end)?;
    let start = window
        .iter()
        .position(|b| !Lexer::is_whitespace(*b as i32))
        .unwrap_or(window.len());
    Ok(window[start..].starts_with(keyword))
}

fn parser_at(stream: &dyn BaseStream, offset: usize) -> PDFResult<Parser> {
    let sub = stream.make_sub_stream(offset, stream.end() - offset)?;
    Parser::new(Lexer::new(sub)?)
}

fn expect_number(parser: &mut Parser, what: &str) -> PDFResult<f64> {
    match parser.get_object()? {
        PDFObject::Number(n) => Ok(n),
        other => Err(PDFError::MalformedObject(format!(
            "Expected {} in cross-reference table, got {:?}",
            what, other
        ))),
    }
}

/// Parses `xref` subsections and the trailer dictionary.
fn parse_xref_table(stream: &dyn BaseStream, offset: usize) -> PDFResult<XRefSection> {
    let mut parser = parser_at(stream, offset)?;
    if !parser.get_object()?.is_command("xref") {
        return Err(PDFError::MalformedObject(format!(
            "Expected 'xref' at {}",
            offset
        )));
    }

    let mut entries = FxHashMap::default();
    loop {
        let first = match parser.get_object()? {
            PDFObject::Command(cmd) if cmd == "trailer" => break,
            PDFObject::Number(n) if n >= 0.0 => n as u32,
            other => {
                return Err(PDFError::MalformedObject(format!(
                    "Expected subsection start or 'trailer', got {:?}",
                    other
                )));
            }
        };
        let count = expect_number(&mut parser, "subsection count")? as u32;

        let mut first = first;
        for i in 0..count {
            let value = expect_number(&mut parser, "entry offset")?;
            let generation = expect_number(&mut parser, "entry generation")? as u32;
            let kind = parser.get_object()?;

            let entry = if kind.is_command("f") {
                XRefEntry::Free {
                    next_free: value as u64,
                    generation,
                }
            } else if kind.is_command("n") {
                XRefEntry::Uncompressed {
                    offset: value as usize,
                    generation,
                }
            } else {
                return Err(PDFError::MalformedObject(format!(
                    "Expected 'f' or 'n' in cross-reference entry, got {:?}",
                    kind
                )));
            };

            // Some writers number the first subsection from 1 although it
            // starts with the free head of object 0.
            if i == 0 && first == 1 && entry == (XRefEntry::Free { next_free: 0, generation: 65535 }) {
                first = 0;
            }

            let num = first + i;
            if matches!(entry, XRefEntry::Uncompressed { offset: 0, .. }) {
                continue;
            }
            entries.insert(num, entry);
        }
    }

    let trailer = match parser.get_object()? {
        PDFObject::Dictionary(dict) => dict,
        other => {
            return Err(PDFError::MalformedObject(format!(
                "Expected trailer dictionary, got {:?}",
                other
            )));
        }
    };

    Ok(XRefSection {
        kind: SectionKind::Table,
        offset: Some(offset),
        entries,
        trailer,
    })
}

/// Parses a cross-reference stream object. Its data is never decrypted.
fn parse_xref_stream(
    stream: &dyn BaseStream,
    offset: usize,
    registry: &FilterRegistry,
    diagnostics: &Diagnostics,
) -> PDFResult<XRefSection> {
    if offset >= stream.end() {
        return Err(PDFError::MalformedObject(format!(
            "Cross-reference stream offset {} is past the end of the file",
            offset
        )));
    }
    let mut parser = parser_at(stream, offset)?;
    let (_, object) = parser.parse_indirect_object(None)?;
    let PDFObject::Stream(xref_stream) = object else {
        return Err(PDFError::MalformedObject(format!(
            "No cross-reference stream at {}",
            offset
        )));
    };
    let dict = &xref_stream.dict;

    let widths: Vec<usize> = dict
        .get("W")
        .and_then(PDFObject::as_array)
        .map(|w| w.iter().filter_map(PDFObject::as_usize).collect())
        .unwrap_or_default();
    if widths.len() != 3 || widths.iter().any(|&w| w > 8) {
        return Err(PDFError::MalformedObject(format!(
            "Invalid /W {:?} in cross-reference stream at {}",
            widths, offset
        )));
    }

    let size = dict.get("Size").and_then(PDFObject::as_usize).unwrap_or(0);
    let ranges: Vec<(usize, usize)> = match dict.get("Index").and_then(PDFObject::as_array) {
        Some(index) => index
            .chunks(2)
            .filter_map(|pair| match pair {
                [start, count] => Some((start.as_usize()?, count.as_usize()?)),
                _ => None,
            })
            .collect(),
        None => vec![(0, size)],
    };

    let decoded = FilterChain::from_dict(dict).decode(&xref_stream.raw, registry, None, diagnostics);
    let data = decoded.bytes;
    let entry_size: usize = widths.iter().sum();
    // counts come from the file; none may claim more entries than the data holds
    let needed = ranges.iter().try_fold(0usize, |total, &(_, count)| {
        count.checked_mul(entry_size)?.checked_add(total)
    });
    match needed {
        Some(needed) if entry_size > 0 && needed <= data.len() => {}
        _ => {
            return Err(PDFError::MalformedObject(format!(
                "Cross-reference stream at {} holds {} bytes, /Index {:?} with entries of {} bytes does not fit",
                offset,
                data.len(),
                ranges,
                entry_size
            )));
        }
    }

    let mut entries = FxHashMap::default();
    let mut pos = 0;
    for (start, count) in ranges {
        for i in 0..count {
            let mut fields = [0u64; 3];
            for (field, &width) in fields.iter_mut().zip(&widths) {
                let bytes = data.get(pos..pos + width).unwrap_or_default();
                *field = bytes.iter().fold(0u64, |acc, &b| acc << 8 | b as u64);
                pos += width;
            }
            let Some(num) = start.checked_add(i).and_then(|n| u32::try_from(n).ok()) else {
                continue;
            };
            let kind = if widths[0] == 0 { 1 } else { fields[0] };
            let entry = match kind {
                0 => XRefEntry::Free {
                    next_free: fields[1],
                    generation: fields[2] as u32,
                },
                1 => XRefEntry::Uncompressed {
                    offset: fields[1] as usize,
                    generation: fields[2] as u32,
                },
                2 => XRefEntry::Compressed {
                    obj_stream_num: fields[1] as u32,
                    index: fields[2] as u32,
                },
                // unknown types are references to the null object
                _ => continue,
            };
            entries.insert(num, entry);
        }
    }

    Ok(XRefSection {
        kind: SectionKind::Stream,
        offset: Some(offset),
        entries,
        trailer: xref_stream.dict.clone(),
    })
}

/// Reads the `N` pairs of object number and relative offset at the start of
/// a decoded object stream.
pub fn read_object_stream_header(data: &[u8], n: usize) -> PDFResult<Vec<(u32, usize)>> {
    let lexer = Lexer::new(Box::new(Stream::from_bytes(Bytes::copy_from_slice(data))))?;
    let mut parser = Parser::new(lexer)?;
    let mut header = Vec::with_capacity(n.min(4096));
    for _ in 0..n {
        let num = parser.get_object()?;
        let offset = parser.get_object()?;
        match (num.as_number(), offset.as_usize()) {
            (Some(num), Some(offset)) if num >= 0.0 => header.push((num as u32, offset)),
            _ => {
                return Err(PDFError::MalformedObject(format!(
                    "Invalid object stream header entry {:?} {:?}",
                    num, offset
                )));
            }
        }
    }
    Ok(header)
}

/// Finds every `N G obj` header in `data`. Yields the reference, the
/// offset of the header and the offset after the `obj` keyword.
pub fn scan_object_headers(data: &[u8]) -> Vec<(Ref, usize, usize)> {
    let mut found = Vec::new();
    let mut search = 0;
    while let Some(hit) = find_subslice(&data[search..], b"obj") {
        let keyword = search + hit;
        search = keyword + 3;

        let after_ok = data
            .get(keyword + 3)
            .is_none_or(|&b| Lexer::is_whitespace(b as i32) || Lexer::is_delimiter(b as i32));
        if !after_ok {
            continue;
        }
        if let Some((reference, start)) = header_before(data, keyword) {
            found.push((reference, start, keyword + 3));
        }
    }
    found
}

/// Reads `num gen` backwards from the `obj` keyword at `keyword`.
fn header_before(data: &[u8], keyword: usize) -> Option<(Ref, usize)> {
    let mut pos = keyword;
    let mut numbers = [0u32; 2];
    for slot in (0..2).rev() {
        let digits_end = {
            let mut p = pos;
            while p > 0 && Lexer::is_whitespace(data[p - 1] as i32) {
                p -= 1;
            }
            if p == pos && slot == 1 {
                // `obj` must be separated from the generation
                return None;
            }
            p
        };
        let mut digits_start = digits_end;
        while digits_start > 0 && data[digits_start - 1].is_ascii_digit() {
            digits_start -= 1;
        }
        if digits_start == digits_end || digits_end - digits_start > 10 {
            return None;
        }
        numbers[slot] = std::str::from_utf8(&data[digits_start..digits_end])
            .ok()?
            .parse()
            .ok()?;
        pos = digits_start;
    }
    let boundary_ok = pos == 0
        || Lexer::is_whitespace(data[pos - 1] as i32)
        || Lexer::is_delimiter(data[pos - 1] as i32);
    boundary_ok.then(|| (Ref::new(numbers[0], numbers[1]), pos))
}

fn parse_object_at(data: &Bytes, offset: usize) -> PDFResult<PDFObject> {
    let stream = Stream::new(data.clone(), offset, data.len() - offset);
    let mut parser = Parser::new(Lexer::new(Box::new(stream))?)?;
    if starts_with_digit(data, offset) {
        parser.parse_indirect_object(None).map(|(_, obj)| obj)
    } else {
        parser.get_object()
    }
}

fn starts_with_digit(data: &[u8], offset: usize) -> bool {
    data[offset..]
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(data: &[u8]) -> Stream {
        Stream::from_bytes(data.to_vec())
    }

    fn load(data: &[u8], startxref: usize) -> PDFResult<XRef> {
        let stream = stream(data);
        let mut loader = XRefLoader::new(startxref);
        while !loader.is_done() {
            loader.parse_next(&stream, &FilterRegistry::with_builtins(), &Diagnostics::new())?;
        }
        loader.finish()
    }

    #[test]
    fn test_xref_entry_is_free() {
        let free_entry = XRefEntry::Free {
            next_free: 0,
            generation: 65535,
        };
        assert!(free_entry.is_free());
        assert_eq!(free_entry.generation(), 65535);

        let uncompressed_entry = XRefEntry::Uncompressed {
            offset: 100,
            generation: 5,
        };
        assert!(!uncompressed_entry.is_free());
        assert_eq!(uncompressed_entry.generation(), 5);
    }

    #[test]
    fn test_parse_xref_with_multiple_entries() {
        let data = b"xref\n\
            0 3\n\
            0000000000 65535 f\n\
            0000000015 00000 n\n\
            0000000079 00000 n\n\
            trailer\n\
            << /Size 3 /Root 1 0 R >>\n";

        let xref = load(data, 0).unwrap();
        assert!(xref.get_entry(0).unwrap().is_free());
        assert_eq!(
            xref.get_entry(1),
            Some(XRefEntry::Uncompressed {
                offset: 15,
                generation: 0
            })
        );
        assert_eq!(
            xref.get_entry(2),
            Some(XRefEntry::Uncompressed {
                offset: 79,
                generation: 0
            })
        );
        assert_eq!(xref.root(), Some(Ref::new(1, 0)));
        assert_eq!(xref.object_numbers(), vec![1, 2]);
    }

    #[test]
    fn test_subsection_numbered_from_one() {
        let data = b"xref\n1 2\n0000000000 65535 f\n0000000042 00000 n\ntrailer\n<< /Size 2 >>\n";
        let xref = load(data, 0).unwrap();
        assert_eq!(
            xref.get_entry(1),
            Some(XRefEntry::Uncompressed {
                offset: 42,
                generation: 0
            })
        );
    }

    #[test]
    fn test_find_startxref() {
        let data = b"%PDF-1.4\n...\nstartxref\n1234\n%%EOF\n";
        assert_eq!(find_startxref(&stream(data)).unwrap(), Some(1234));
        assert_eq!(find_startxref(&stream(b"%PDF-1.4 no trailer")).unwrap(), None);
    }

    #[test]
    fn test_prev_chain_newest_wins_and_revisions() {
        let mut data = Vec::new();
        let first = data.len();
        data.extend_from_slice(
            b"xref\n0 3\n0000000000 65535 f\n0000000100 00000 n\n0000000200 00000 n\ntrailer\n<< /Size 3 /Root 1 0 R >>\n",
        );
        let second = data.len();
        data.extend_from_slice(
            format!(
                "xref\n2 1\n0000000300 00000 n\ntrailer\n<< /Size 3 /Prev {} /Info 9 0 R >>\n",
                first
            )
            .as_bytes(),
        );

        let xref = load(&data, second).unwrap();
        assert_eq!(xref.revision_count(), 2);
        assert_eq!(
            xref.get_entry(2),
            Some(XRefEntry::Uncompressed {
                offset: 300,
                generation: 0
            })
        );
        assert_eq!(
            xref.entry_at_revision(2, 0),
            Some(XRefEntry::Uncompressed {
                offset: 200,
                generation: 0
            })
        );
        assert_eq!(
            xref.entry_at_revision(1, 1),
            Some(XRefEntry::Uncompressed {
                offset: 100,
                generation: 0
            })
        );
        // merged trailer keeps /Root from the older section
        assert_eq!(xref.root(), Some(Ref::new(1, 0)));
        assert!(xref.trailer().contains_key("Info"));
        assert!(!xref.trailer().contains_key("Prev"));
    }

    #[test]
    fn test_prev_cycle_is_cut() {
        let data = b"xref\n0 1\n0000000000 65535 f\ntrailer\n<< /Size 1 /Prev 0 /Root 1 0 R >>\n";
        let xref = load(data, 0).unwrap();
        assert_eq!(xref.revision_count(), 1);
    }

    fn xref_stream_object(num: u32, rows: &[[u8; 4]], extra: &str) -> Vec<u8> {
        let body: Vec<u8> = rows.iter().flatten().copied().collect();
        let mut out = format!(
            "{} 0 obj\n<< /Type /XRef /W [1 2 1] /Size {} /Length {}{} >>\nstream\n",
            num,
            rows.len(),
            body.len(),
            extra
        )
        .into_bytes();
        out.extend_from_slice(&body);
        out.extend_from_slice(b"\nendstream\nendobj\n");
        out
    }

    #[test]
    fn test_xref_stream() {
        let data = xref_stream_object(
            3,
            &[
                [0, 0, 0, 255],
                [1, 0, 15, 0],
                [2, 0, 5, 1],
                [1, 0, 0x2a, 0],
            ],
            " /Root 1 0 R",
        );
        let xref = load(&data, 0).unwrap();

        assert_eq!(xref.sections()[0].kind, SectionKind::Stream);
        assert_eq!(
            xref.get_entry(1),
            Some(XRefEntry::Uncompressed {
                offset: 15,
                generation: 0
            })
        );
        assert_eq!(
            xref.get_entry(2),
            Some(XRefEntry::Compressed {
                obj_stream_num: 5,
                index: 1
            })
        );
        assert_eq!(xref.root(), Some(Ref::new(1, 0)));
        assert!(!xref.trailer().contains_key("W"));
    }

    #[test]
    fn test_xref_stream_count_larger_than_data() {
        let data = xref_stream_object(3, &[[1, 0, 15, 0]], " /Index [0 4611686018427387904]");
        assert!(matches!(load(&data, 0), Err(PDFError::MalformedObject(_))));

        let data = xref_stream_object(3, &[[1, 0, 15, 0]], " /Index [0 1 5 18446744073709551615]");
        assert!(matches!(load(&data, 0), Err(PDFError::MalformedObject(_))));
    }

    #[test]
    fn test_xref_stream_numbers_past_u32_are_skipped() {
        let data = xref_stream_object(
            3,
            &[[1, 0, 15, 0], [1, 0, 16, 0]],
            " /Index [1 1 4294967296 1] /Root 1 0 R",
        );
        let xref = load(&data, 0).unwrap();
        assert_eq!(
            xref.get_entry(1),
            Some(XRefEntry::Uncompressed {
                offset: 15,
                generation: 0
            })
        );
        assert_eq!(xref.get_entry(0), None);
    }

    #[test]
    fn test_hybrid_table_uses_xref_stm() {
        let mut data = xref_stream_object(9, &[[0, 0, 0, 0], [0, 0, 0, 0], [2, 0, 7, 0]], "");
        let table = data.len();
        data.extend_from_slice(
            b"xref\n0 3\n0000000000 65535 f\n0000000077 00000 n\n0000000000 65535 f\ntrailer\n<< /Size 3 /Root 1 0 R /XRefStm 0 >>\n",
        );

        let xref = load(&data, table).unwrap();
        assert_eq!(xref.revision_count(), 1);
        assert_eq!(
            xref.get_entry(2),
            Some(XRefEntry::Compressed {
                obj_stream_num: 7,
                index: 0
            })
        );
        assert_eq!(
            xref.get_entry(1),
            Some(XRefEntry::Uncompressed {
                offset: 77,
                generation: 0
            })
        );
    }

    #[test]
    fn test_bad_offset_is_an_error() {
        let data = b"%PDF-1.4\nnot an xref";
        assert!(load(data, 500).is_err());
        assert!(load(data, 0).is_err());
    }

    #[test]
    fn test_data_missing_leaves_loader_unchanged() {
        struct Partial(Stream, usize);
        impl BaseStream for Partial {
            fn length(&self) -> usize {
                self.0.length()
            }
            fn start(&self) -> usize {
                self.0.start()
            }
            fn pos(&self) -> usize {
                self.0.pos()
            }
            fn set_pos(&mut self, pos: usize) -> PDFResult<()> {
                self.0.set_pos(pos)
            }
            fn get_byte(&mut self) -> PDFResult<u8> {
                if self.0.pos() >= self.1 {
                    return Err(PDFError::DataMissing {
                        position: self.0.pos(),
                        length: 1,
                    });
                }
                self.0.get_byte()
            }
            fn get_bytes(&mut self, length: usize) -> PDFResult<Bytes> {
                self.0.get_bytes(length)
            }
            fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
                if end > self.1 {
                    return Err(PDFError::DataMissing {
                        position: begin,
                        length: end - begin,
                    });
                }
                self.0.get_byte_range(begin, end)
            }
            fn make_sub_stream(&self, start: usize, length: usize) -> PDFResult<Box<dyn BaseStream>> {
                let sub = Stream::new(self.0.bytes().clone(), start, length);
                Ok(Box::new(Partial(sub, self.1)))
            }
        }

        let data = b"xref\n0 1\n0000000000 65535 f\ntrailer\n<< /Size 1 /Root 1 0 R >>\n";
        let partial = Partial(stream(data), 20);
        let mut loader = XRefLoader::new(0);
        let result = loader.parse_next(&partial, &FilterRegistry::with_builtins(), &Diagnostics::new());
        assert!(matches!(result, Err(PDFError::DataMissing { .. })));
        assert_eq!(loader.next_offset(), Some(0));
    }

    #[test]
    fn test_scan_object_headers() {
        let data = b"%PDF-1.7\n1 0 obj\n<< >>\nendobj\n12 3 obj 5 endobj\nnotanobj 4 0 objx";
        let headers = scan_object_headers(data);
        let refs: Vec<Ref> = headers.iter().map(|(r, _, _)| *r).collect();
        assert_eq!(refs, vec![Ref::new(1, 0), Ref::new(12, 3)]);
        assert_eq!(headers[0].1, 9);
    }

    #[test]
    fn test_reconstruct_uses_trailer() {
        let data = Bytes::from_static(
            b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n2 0 obj\n<< /Type /Pages /Kids [] /Count 0 >>\nendobj\ntrailer\n<< /Root 1 0 R >>\n%%EOF",
        );
        let diagnostics = Diagnostics::new();
        let xref = XRef::reconstruct(&data, &FilterRegistry::with_builtins(), &diagnostics).unwrap();
        assert!(xref.is_repaired());
        assert_eq!(xref.root(), Some(Ref::new(1, 0)));
        assert_eq!(
            xref.get_entry(2),
            Some(XRefEntry::Uncompressed {
                offset: 58,
                generation: 0
            })
        );
        assert!(diagnostics.has(WarningKind::XRefRepaired));
    }

    #[test]
    fn test_reconstruct_finds_catalog_without_trailer() {
        let data = Bytes::from_static(b"%PDF-1.4\n4 0 obj\n<< /Type /Catalog >>\nendobj\n");
        let xref =
            XRef::reconstruct(&data, &FilterRegistry::with_builtins(), &Diagnostics::new()).unwrap();
        assert_eq!(xref.root(), Some(Ref::new(4, 0)));
    }

    #[test]
    fn test_reconstruct_rejects_garbage() {
        let registry = FilterRegistry::with_builtins();
        assert!(XRef::reconstruct(&Bytes::new(), &registry, &Diagnostics::new()).is_err());
        assert!(
            XRef::reconstruct(&Bytes::from_static(b"hello"), &registry, &Diagnostics::new())
                .is_err()
        );
    }

    #[test]
    fn test_object_stream_header() {
        let header = read_object_stream_header(b"10 0 11 14 12 30 ", 3).unwrap();
        assert_eq!(header, vec![(10, 0), (11, 14), (12, 30)]);
        assert!(read_object_stream_header(b"10 0 /Oops", 2).is_err());
    }
}
