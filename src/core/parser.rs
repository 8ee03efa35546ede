use super::encryption::CipherTransform;
use super::error::{PDFError, PDFResult};
use super::lexer::{Lexer, Token};
use super::primitives::{Dict, PDFObject, Ref, StreamObject};
use bytes::Bytes;
use log::{trace, warn};

const ENDSTREAM: &[u8] = b"endstream";

/// Scan window used while looking for `endstream`.
const SCAN_BLOCK: usize = 4096;

/// Resolves an indirect `/Length` while a stream is being parsed.
///
/// Returns `Err(ObjectPending(r))` when `r` is not loaded yet; the caller
/// fetches it and parses again.
pub type RefResolver = Box<dyn Fn(Ref) -> PDFResult<PDFObject> + Send>;

/// Builds objects from the token stream of a [`Lexer`].
///
/// Two tokens of lookahead are kept so `N G R` references and the `stream`
/// keyword after a dictionary can be recognised. Lookahead never runs past
/// `stream` or an inline image's `ID`, since binary data follows them.
pub struct Parser {
    lexer: Lexer,

    buf1: Option<Token>,

    buf2: Option<Token>,

    ref_resolver: Option<RefResolver>,

    /// Decrypts strings of the object being parsed.
    cipher: Option<CipherTransform>,
}

impl Parser {
    pub fn new(lexer: Lexer) -> PDFResult<Self> {
        let mut parser = Parser {
            lexer,
            buf1: None,
            buf2: None,
            ref_resolver: None,
            cipher: None,
        };
        parser.fill()?;
        Ok(parser)
    }

    pub fn set_ref_resolver<F>(&mut self, resolver: F)
    where
        F: Fn(Ref) -> PDFResult<PDFObject> + Send + 'static,
    {
        self.ref_resolver = Some(Box::new(resolver));
    }

    pub fn set_cipher(&mut self, cipher: Option<CipherTransform>) {
        self.cipher = cipher;
    }

    pub fn lexer(&self) -> &Lexer {
        &self.lexer
    }

    fn blocks_lookahead(token: &Option<Token>) -> bool {
        matches!(token, Some(Token::Command(cmd)) if cmd == "stream" || cmd == "ID")
    }

    fn fill(&mut self) -> PDFResult<()> {
        if self.buf1.is_none() {
            self.buf1 = Some(self.lexer.get_object()?);
        }
        if self.buf2.is_none() && !Self::blocks_lookahead(&self.buf1) {
            self.buf2 = Some(self.lexer.get_object()?);
        }
        Ok(())
    }

    fn shift(&mut self) -> PDFResult<()> {
        self.buf1 = self.buf2.take();
        self.fill()
    }

    fn take_token(&mut self) -> PDFResult<Token> {
        self.fill()?;
        let token = self.buf1.take().unwrap_or(Token::EOF);
        self.shift()?;
        Ok(token)
    }

    /// True until the end of input is reached.
    pub fn has_more(&self) -> bool {
        !matches!(&self.buf1, Some(Token::EOF) | None)
    }

    /// Parses the next object.
    ///
    /// Arrays, dictionaries, `N G R` references and streams are assembled
    /// here; keywords come back as [`PDFObject::Command`]. An inline image
    /// (`BI ... ID data EI`) comes back as a stream object, followed by the
    /// `EI` command on the next call.
    pub fn get_object(&mut self) -> PDFResult<PDFObject> {
        let token = self.take_token()?;

        match token {
            Token::ArrayStart => self.parse_array(),
            Token::DictStart => self.parse_dictionary(),
            Token::ArrayEnd => Err(PDFError::MalformedObject(
                "Unexpected array end token".to_string(),
            )),
            Token::DictEnd => Err(PDFError::MalformedObject(
                "Unexpected dictionary end token".to_string(),
            )),
            Token::Number(n) => {
                if let (Some(Token::Number(generation)), Some(Token::Command(cmd))) =
                    (&self.buf1, &self.buf2)
                {
                    if cmd == "R" && is_object_number(n) && is_object_number(*generation) {
                        let reference = Ref::new(n as u32, *generation as u32);
                        self.shift()?;
                        self.shift()?;
                        return Ok(PDFObject::Ref(reference));
                    }
                }
                Ok(PDFObject::Number(n))
            }
            Token::EOF => Ok(PDFObject::EOF),
            Token::Boolean(b) => Ok(PDFObject::Boolean(b)),
            Token::Null => Ok(PDFObject::Null),
            Token::String(s) => Ok(PDFObject::String(self.decrypt(s))),
            Token::HexString(s) => Ok(PDFObject::HexString(self.decrypt(s))),
            Token::Name(n) => Ok(PDFObject::Name(n)),
            Token::Command(c) if c == "BI" => self.parse_inline_image(),
            Token::Command(c) => Ok(PDFObject::Command(c)),
        }
    }

    fn decrypt(&self, data: Vec<u8>) -> Vec<u8> {
        match &self.cipher {
            Some(cipher) => cipher.decrypt_string(&data),
            None => data,
        }
    }

    fn parse_array(&mut self) -> PDFResult<PDFObject> {
        let mut array = Vec::new();

        loop {
            match &self.buf1 {
                Some(Token::ArrayEnd) => {
                    self.shift()?;
                    break;
                }
                Some(Token::EOF) | None => {
                    return Err(PDFError::TruncatedStream(
                        "Unterminated array (missing ']')".to_string(),
                    ));
                }
                _ => {}
            }

            match self.get_object() {
                Ok(obj) => array.push(obj),
                Err(PDFError::MalformedObject(msg)) => {
                    warn!("Malformed array element replaced by null: {}", msg);
                    array.push(PDFObject::Null);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(PDFObject::Array(array))
    }

    fn parse_dict_entries(&mut self, end: fn(&Token) -> bool) -> PDFResult<Dict> {
        let mut dict = Dict::new();

        loop {
            let key = match &self.buf1 {
                Some(token) if end(token) => break,
                Some(Token::EOF) | None => {
                    return Err(PDFError::TruncatedStream(
                        "Unterminated dictionary (missing '>>')".to_string(),
                    ));
                }
                Some(Token::Name(name)) => name.clone(),
                Some(other) => {
                    warn!("Skipping non-name dictionary key {:?}", other);
                    self.shift()?;
                    continue;
                }
            };
            self.shift()?;

            match &self.buf1 {
                Some(Token::EOF) | None => {
                    return Err(PDFError::TruncatedStream(format!(
                        "Unterminated dictionary after key /{}",
                        key
                    )));
                }
                Some(token) if end(token) => {
                    dict.insert(key, PDFObject::Null);
                    break;
                }
                _ => {}
            }

            let value = match self.get_object() {
                Ok(value) => value,
                Err(PDFError::MalformedObject(msg)) => {
                    warn!("Malformed value for /{} replaced by null: {}", key, msg);
                    PDFObject::Null
                }
                Err(e) => return Err(e),
            };
            dict.insert(key, value);
        }

        Ok(dict)
    }

    fn parse_dictionary(&mut self) -> PDFResult<PDFObject> {
        let dict = self.parse_dict_entries(|token| matches!(token, Token::DictEnd))?;

        // buf1 is '>>'; a following `stream` keyword makes this a stream.
        if matches!(&self.buf2, Some(Token::Command(cmd)) if cmd == "stream") {
            self.buf1 = None;
            self.buf2 = None;
            return self.parse_stream(dict);
        }

        self.shift()?;
        Ok(PDFObject::Dictionary(dict))
    }

    fn resolve_length(&self, dict: &Dict) -> PDFResult<Option<usize>> {
        match dict.get("Length") {
            Some(PDFObject::Ref(reference)) => {
                let Some(resolver) = &self.ref_resolver else {
                    return Ok(None);
                };
                match resolver(*reference) {
                    Ok(resolved) => Ok(resolved.as_usize()),
                    Err(e @ (PDFError::ObjectPending(_) | PDFError::DataMissing { .. })) => Err(e),
                    Err(e) => {
                        warn!("Cannot resolve /Length {}: {}, scanning for endstream", reference, e);
                        Ok(None)
                    }
                }
            }
            Some(obj) => Ok(obj.as_usize()),
            None => Ok(None),
        }
    }

    /// Reads the payload of a stream whose `stream` keyword was just lexed.
    fn parse_stream(&mut self, dict: Dict) -> PDFResult<PDFObject> {
        let start = self.lexer.skip_stream_eol()?;
        let stream_end = self.lexer.stream().end();

        if let Some(length) = self.resolve_length(&dict)? {
            let end = start.saturating_add(length);
            if end <= stream_end {
                let raw = self.lexer.stream().get_byte_range(start, end)?;
                self.lexer.seek(end)?;
                if matches!(self.lexer.get_object()?, Token::Command(cmd) if cmd == "endstream") {
                    self.fill()?;
                    return Ok(PDFObject::Stream(Box::new(StreamObject::new(dict, raw, start))));
                }
            }
            trace!("Stream /Length {} at {} is wrong, scanning", length, start);
        }

        let (raw, after) = self.scan_for_endstream(start)?;
        self.lexer.seek(after)?;
        self.fill()?;
        Ok(PDFObject::Stream(Box::new(StreamObject::new(dict, raw, start))))
    }

    /// Finds `endstream` after `start`. Returns the payload (without the end
    /// of line before the keyword) and the offset after the keyword.
    fn scan_for_endstream(&mut self, start: usize) -> PDFResult<(Bytes, usize)> {
        let stream = self.lexer.stream();
        let end = stream.end();
        let mut pos = start;

        while pos < end {
            let block_end = (pos + SCAN_BLOCK + ENDSTREAM.len()).min(end);
            let block = stream.get_byte_range(pos, block_end)?;
            if let Some(found) = find_subslice(&block, ENDSTREAM) {
                let keyword = pos + found;
                let mut data_end = keyword;
                if data_end > start && stream.get_byte_range(data_end - 1, data_end)?[0] == b'\n' {
                    data_end -= 1;
                }
                if data_end > start && stream.get_byte_range(data_end - 1, data_end)?[0] == b'\r' {
                    data_end -= 1;
                }
                let raw = stream.get_byte_range(start, data_end)?;
                return Ok((raw, keyword + ENDSTREAM.len()));
            }
            if block_end == end {
                break;
            }
            pos += SCAN_BLOCK;
        }

        warn!("Stream at {} has no endstream, using data up to the end", start);
        Ok((stream.get_byte_range(start, end)?, end))
    }

    /// `BI` was consumed: reads the image dictionary up to `ID` and the
    /// image data through `EI`.
    fn parse_inline_image(&mut self) -> PDFResult<PDFObject> {
        let dict =
            self.parse_dict_entries(|token| matches!(token, Token::Command(cmd) if cmd == "ID"))?;

        // Lexer sits right after `ID`.
        let raw = self.lexer.read_inline_image_data()?;
        self.buf1 = Some(Token::Command("EI".to_string()));
        self.buf2 = None;
        self.fill()?;

        Ok(PDFObject::Stream(Box::new(StreamObject::new(dict, raw, 0))))
    }

    /// Parses `N G obj <object> endobj`.
    ///
    /// With `expected` set, a header naming a different object fails with
    /// `MalformedObject` so the caller can attempt a repair.
    pub fn parse_indirect_object(&mut self, expected: Option<Ref>) -> PDFResult<(Ref, PDFObject)> {
        let num = self.take_token()?;
        let generation = self.take_token()?;
        let keyword = self.take_token()?;

        let reference = match (num, generation, keyword) {
            (Token::Number(num), Token::Number(generation), Token::Command(obj))
                if obj == "obj" && is_object_number(num) && is_object_number(generation) =>
            {
                Ref::new(num as u32, generation as u32)
            }
            (Token::EOF, _, _) | (_, Token::EOF, _) | (_, _, Token::EOF) => {
                return Err(PDFError::MalformedObject(
                    "Unexpected end of data in object header".to_string(),
                ));
            }
            (num, generation, keyword) => {
                return Err(PDFError::MalformedObject(format!(
                    "Expected object header, found {:?} {:?} {:?}",
                    num, generation, keyword
                )));
            }
        };

        if let Some(expected) = expected {
            if expected.num != reference.num {
                return Err(PDFError::MalformedObject(format!(
                    "Expected object {}, found {}",
                    expected, reference
                )));
            }
        }

        let value = self.get_object()?;
        if matches!(value, PDFObject::EOF | PDFObject::Command(_)) {
            return Err(PDFError::MalformedObject(format!(
                "Object {} has no value",
                reference
            )));
        }
        if matches!(&self.buf1, Some(Token::Command(cmd)) if cmd == "endobj") {
            self.shift()?;
        }
        Ok((reference, value))
    }
}

fn is_object_number(n: f64) -> bool {
    n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
