use super::base_stream::BaseStream;
use super::error::{PDFError, PDFResult};
use bytes::Bytes;

/// Tokens produced by the [`Lexer`].
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// End of input
    EOF,

    Boolean(bool),

    Null,

    /// Integers and reals
    Number(f64),

    /// Literal string `( ... )`, raw bytes after escape processing
    String(Vec<u8>),

    /// Hex string `< ... >`
    HexString(Vec<u8>),

    /// Name without the leading `/`, `#xx` escapes decoded
    Name(String),

    /// Keyword or content-stream operator
    Command(String),

    ArrayStart,

    ArrayEnd,

    DictStart,

    DictEnd,
}

const MAX_COMMAND_LENGTH: usize = 128;

/// Tokenizer for PDF syntax.
///
/// Works over any [`BaseStream`], so it serves both the file-level object
/// parser (over a chunked view of the source) and the content-stream
/// interpreter (over decoded bytes). A `DataMissing` error from the stream
/// is passed through untouched; the lexer is then in an undefined state and
/// the caller restarts from a known offset once the data has arrived.
///
/// Unterminated strings and hex strings fail with `TruncatedStream`.
pub struct Lexer {
    stream: Box<dyn BaseStream>,

    /// Byte under examination, -1 at end of input
    current_char: i32,

    str_buf: Vec<u8>,
}

impl Lexer {
    pub fn new(mut stream: Box<dyn BaseStream>) -> PDFResult<Self> {
        let current_char = Self::read_char(&mut stream)?;

        Ok(Lexer {
            stream,
            current_char,
            str_buf: Vec::new(),
        })
    }

    fn read_char(stream: &mut Box<dyn BaseStream>) -> PDFResult<i32> {
        match stream.get_byte() {
            Ok(byte) => Ok(byte as i32),
            Err(PDFError::UnexpectedEndOfStream) => Ok(-1),
            Err(e) => Err(e),
        }
    }

    fn next_char(&mut self) -> PDFResult<i32> {
        self.current_char = Self::read_char(&mut self.stream)?;
        Ok(self.current_char)
    }

    fn peek_char(&mut self) -> PDFResult<i32> {
        match self.stream.peek_byte() {
            Ok(byte) => Ok(byte as i32),
            Err(PDFError::UnexpectedEndOfStream) => Ok(-1),
            Err(e) => Err(e),
        }
    }

    /// Absolute offset of the byte the lexer will look at next.
    pub fn position(&self) -> usize {
        if self.current_char < 0 {
            self.stream.pos()
        } else {
            self.stream.pos() - 1
        }
    }

    /// Moves to `pos` and discards the lookahead.
    pub fn seek(&mut self, pos: usize) -> PDFResult<()> {
        self.stream.set_pos(pos)?;
        self.next_char()?;
        Ok(())
    }

    /// The underlying stream.
    pub fn stream(&self) -> &dyn BaseStream {
        self.stream.as_ref()
    }

    /// Consumes the byte under examination and returns it.
    pub fn get_stream_byte(&mut self) -> PDFResult<Option<u8>> {
        let ch = self.current_char;
        if ch < 0 {
            return Ok(None);
        }
        self.next_char()?;
        Ok(Some(ch as u8))
    }

    /// Skips the end-of-line after a `stream` keyword.
    ///
    /// Accepts CRLF, LF and (non-conforming) a lone CR. Returns the offset
    /// where the stream payload starts.
    pub fn skip_stream_eol(&mut self) -> PDFResult<usize> {
        if self.current_char == 0x0D {
            self.next_char()?;
        }
        if self.current_char == 0x0A {
            self.next_char()?;
        }
        Ok(self.position())
    }

    pub fn is_whitespace(ch: i32) -> bool {
        matches!(ch, 0x00 | 0x09 | 0x0A | 0x0C | 0x0D | 0x20)
    }

    /// `( ) < > [ ] { } / %`
    pub fn is_delimiter(ch: i32) -> bool {
        matches!(
            ch,
            0x28 | 0x29 | 0x3C | 0x3E | 0x5B | 0x5D | 0x7B | 0x7D | 0x2F | 0x25
        )
    }

    fn is_special(ch: i32) -> bool {
        Self::is_whitespace(ch) || Self::is_delimiter(ch)
    }

    fn skip_whitespace_and_comments(&mut self) -> PDFResult<()> {
        let mut comment = false;

        loop {
            let ch = self.current_char;
            if ch < 0 {
                break;
            }

            if comment {
                if ch == 0x0A || ch == 0x0D {
                    comment = false;
                }
            } else if ch == 0x25 {
                comment = true;
            } else if !Self::is_whitespace(ch) {
                break;
            }

            self.next_char()?;
        }

        Ok(())
    }

    /// Returns the next token.
    pub fn get_object(&mut self) -> PDFResult<Token> {
        self.skip_whitespace_and_comments()?;

        let ch = self.current_char;
        if ch < 0 {
            return Ok(Token::EOF);
        }

        match ch {
            // 0-9 + - .
            0x30..=0x39 | 0x2B | 0x2D | 0x2E => self.get_number(),
            // (
            0x28 => self.get_string(),
            // /
            0x2F => self.get_name(),
            // [
            0x5B => {
                self.next_char()?;
                Ok(Token::ArrayStart)
            }
            // ]
            0x5D => {
                self.next_char()?;
                Ok(Token::ArrayEnd)
            }
            // < or <<
            0x3C => {
                if self.next_char()? == 0x3C {
                    self.next_char()?;
                    Ok(Token::DictStart)
                } else {
                    self.get_hex_string()
                }
            }
            // >>
            0x3E => {
                let next_ch = self.next_char()?;
                if next_ch == 0x3E {
                    self.next_char()?;
                    Ok(Token::DictEnd)
                } else {
                    Err(PDFError::MalformedObject(format!(
                        "Unexpected '>' followed by {} at {}",
                        next_ch,
                        self.position()
                    )))
                }
            }
            // stray )
            0x29 => {
                self.next_char()?;
                Err(PDFError::MalformedObject(format!(
                    "Illegal character ')' at {}",
                    self.position()
                )))
            }
            _ => self.get_command(),
        }
    }

    /// Numbers, tolerating the quirks Acrobat accepts: doubled minus signs,
    /// line breaks after the sign, stray minus signs inside the digits and
    /// a bare sign read as 0.
    fn get_number(&mut self) -> PDFResult<Token> {
        let mut ch = self.current_char;
        let mut e_notation = false;
        // Non-zero once a decimal point has been seen
        let mut divide_by = 0.0;
        let mut sign = 1.0;

        if ch == 0x2D {
            sign = -1.0;
            ch = self.next_char()?;
            if ch == 0x2D {
                ch = self.next_char()?;
            }
        } else if ch == 0x2B {
            ch = self.next_char()?;
        }

        if ch == 0x0A || ch == 0x0D {
            loop {
                ch = self.next_char()?;
                if ch != 0x0A && ch != 0x0D {
                    break;
                }
            }
        }

        if ch == 0x2E {
            divide_by = 10.0;
            ch = self.next_char()?;
        }

        if !(0x30..=0x39).contains(&ch) {
            if Self::is_whitespace(ch) || ch == 0x28 || ch == 0x3C || ch == -1 {
                return Ok(Token::Number(0.0));
            }
            return Err(PDFError::MalformedObject(format!(
                "Invalid number at {} (char code {})",
                self.position(),
                ch
            )));
        }

        let mut base_value = (ch - 0x30) as f64;
        let mut power_value = 0i32;
        let mut power_value_sign = 1;

        loop {
            ch = self.next_char()?;
            if ch < 0 {
                break;
            }

            if (0x30..=0x39).contains(&ch) {
                let digit = (ch - 0x30) as f64;
                if e_notation {
                    power_value = power_value.saturating_mul(10).saturating_add(ch - 0x30);
                } else {
                    if divide_by != 0.0 {
                        divide_by *= 10.0;
                    }
                    base_value = base_value * 10.0 + digit;
                }
            } else if ch == 0x2E {
                if divide_by == 0.0 {
                    divide_by = 1.0;
                } else {
                    break;
                }
            } else if ch == 0x2D {
                // ignored
            } else if ch == 0x45 || ch == 0x65 {
                // An exponent, or the start of the next operator
                let peek_ch = self.peek_char()?;
                if peek_ch == 0x2B || peek_ch == 0x2D {
                    power_value_sign = if peek_ch == 0x2D { -1 } else { 1 };
                    self.next_char()?;
                } else if !(0x30..=0x39).contains(&peek_ch) {
                    break;
                }
                e_notation = true;
            } else {
                break;
            }
        }

        let mut result = base_value;
        if divide_by != 0.0 {
            result /= divide_by;
        }
        if e_notation {
            result *= 10_f64.powi(power_value_sign * power_value);
        }

        Ok(Token::Number(sign * result))
    }

    fn get_string(&mut self) -> PDFResult<Token> {
        let start = self.position();
        let mut depth = 1;
        self.str_buf.clear();

        let mut ch = self.next_char()?;

        loop {
            let mut char_buffered = false;

            match ch {
                -1 => return Err(unterminated("string", start)),
                0x28 => {
                    depth += 1;
                    self.str_buf.push(b'(');
                }
                0x29 => {
                    depth -= 1;
                    if depth == 0 {
                        self.next_char()?;
                        break;
                    }
                    self.str_buf.push(b')');
                }
                0x5C => {
                    ch = self.next_char()?;
                    match ch {
                        -1 => return Err(unterminated("string", start)),
                        0x6E => self.str_buf.push(b'\n'),
                        0x72 => self.str_buf.push(b'\r'),
                        0x74 => self.str_buf.push(b'\t'),
                        0x62 => self.str_buf.push(0x08),
                        0x66 => self.str_buf.push(0x0C),
                        0x5C | 0x28 | 0x29 => self.str_buf.push(ch as u8),
                        0x30..=0x37 => {
                            // Up to three octal digits
                            let mut x = (ch & 0x0F) as u8;
                            ch = self.next_char()?;
                            char_buffered = true;

                            if (0x30..=0x37).contains(&ch) {
                                x = (x << 3).wrapping_add((ch & 0x0F) as u8);
                                ch = self.next_char()?;

                                if (0x30..=0x37).contains(&ch) {
                                    char_buffered = false;
                                    x = (x << 3).wrapping_add((ch & 0x0F) as u8);
                                }
                            }
                            self.str_buf.push(x);
                        }
                        // Escaped line break: continuation
                        0x0D => {
                            if self.peek_char()? == 0x0A {
                                self.next_char()?;
                            }
                        }
                        0x0A => {}
                        _ => self.str_buf.push(ch as u8),
                    }
                }
                _ => self.str_buf.push(ch as u8),
            }

            if !char_buffered {
                ch = self.next_char()?;
            }
        }

        Ok(Token::String(std::mem::take(&mut self.str_buf)))
    }

    fn to_hex_digit(ch: i32) -> i32 {
        match ch {
            0x30..=0x39 => ch & 0x0F,
            0x41..=0x46 | 0x61..=0x66 => (ch & 0x0F) + 9,
            _ => -1,
        }
    }

    fn get_hex_string(&mut self) -> PDFResult<Token> {
        let start = self.position();
        self.str_buf.clear();
        let mut ch = self.current_char;
        let mut first_digit = -1;

        loop {
            if ch < 0 {
                return Err(unterminated("hex string", start));
            } else if ch == 0x3E {
                self.next_char()?;
                break;
            } else if Self::is_whitespace(ch) {
                ch = self.next_char()?;
                continue;
            }

            let digit = Self::to_hex_digit(ch);
            if digit == -1 {
                // skip garbage
            } else if first_digit == -1 {
                first_digit = digit;
            } else {
                self.str_buf.push(((first_digit << 4) | digit) as u8);
                first_digit = -1;
            }
            ch = self.next_char()?;
        }

        // Odd digit count: the last digit is padded with 0
        if first_digit != -1 {
            self.str_buf.push((first_digit << 4) as u8);
        }

        Ok(Token::HexString(std::mem::take(&mut self.str_buf)))
    }

    fn get_name(&mut self) -> PDFResult<Token> {
        self.str_buf.clear();
        let mut ch = self.next_char()?;

        while ch >= 0 && !Self::is_special(ch) {
            if ch == 0x23 {
                ch = self.next_char()?;
                if Self::is_special(ch) {
                    self.str_buf.push(b'#');
                    break;
                }

                let x = Self::to_hex_digit(ch);
                if x == -1 {
                    self.str_buf.push(b'#');
                    self.str_buf.push(ch as u8);
                } else {
                    let previous_ch = ch;
                    ch = self.next_char()?;
                    let x2 = Self::to_hex_digit(ch);
                    if x2 == -1 {
                        // Not an escape after all; keep the text verbatim
                        self.str_buf.push(b'#');
                        self.str_buf.push(previous_ch as u8);
                        if Self::is_special(ch) {
                            break;
                        }
                        self.str_buf.push(ch as u8);
                        ch = self.next_char()?;
                        continue;
                    }
                    self.str_buf.push(((x << 4) | x2) as u8);
                }
            } else {
                self.str_buf.push(ch as u8);
            }

            ch = self.next_char()?;
        }

        Ok(Token::Name(String::from_utf8_lossy(&self.str_buf).into_owned()))
    }

    fn get_command(&mut self) -> PDFResult<Token> {
        let mut command = String::new();
        let mut ch = self.current_char;

        while ch >= 0 && !Self::is_special(ch) {
            if command.len() >= MAX_COMMAND_LENGTH {
                return Err(PDFError::MalformedObject(format!(
                    "Command token too long at {}",
                    self.position()
                )));
            }
            command.push(ch as u8 as char);
            ch = self.next_char()?;
        }

        Ok(match command.as_str() {
            "true" => Token::Boolean(true),
            "false" => Token::Boolean(false),
            "null" => Token::Null,
            _ => Token::Command(command),
        })
    }

    /// Reads inline image data following an `ID` operator, through the
    /// closing `EI`.
    ///
    /// The data starts after the single whitespace byte that ends `ID` and
    /// runs up to the whitespace before an `EI` that is itself followed by
    /// whitespace or the end of input. The lexer is left after `EI`.
    pub fn read_inline_image_data(&mut self) -> PDFResult<Bytes> {
        let start_pos = self.position();
        let data_start = if Self::is_whitespace(self.current_char) {
            start_pos + 1
        } else {
            start_pos
        };
        let end = self.stream.end();

        let mut pos = data_start;
        while pos + 1 < end {
            let window = self.stream.get_byte_range(pos, (pos + 3).min(end))?;
            let before_ok = pos == data_start
                || Self::is_whitespace(self.stream.get_byte_range(pos - 1, pos)?[0] as i32);
            if before_ok && window[0] == b'E' && window[1] == b'I' {
                let after_ok = window.len() < 3 || Self::is_special(window[2] as i32);
                if after_ok {
                    let data_end = if pos > data_start { pos - 1 } else { pos };
                    let data = self.stream.get_byte_range(data_start, data_end)?;
                    self.seek(pos + 2)?;
                    return Ok(data);
                }
            }
            pos += 1;
        }

        Err(PDFError::TruncatedStream(format!(
            "Inline image at {} has no EI",
            start_pos
        )))
    }
}

fn unterminated(what: &str, start: usize) -> PDFError {
    PDFError::TruncatedStream(format!("Unterminated {} starting at {}", what, start))
}
