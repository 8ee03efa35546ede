use super::base_stream::BaseStream;
use super::error::{PDFError, PDFResult};
use bytes::Bytes;

/// A simple in-memory stream implementation.
///
/// Used for fully loaded documents, decoded stream payloads (content
/// streams, object streams) and tests. The data lives in a [`Bytes`] buffer,
/// so sub-streams and byte ranges share it without copying.
#[derive(Debug, Clone)]
pub struct Stream {
    /// The underlying byte buffer
    bytes: Bytes,
    /// Current read position (absolute)
    pos: usize,
    /// Starting offset in the buffer
    start: usize,
    /// Length of accessible data from start
    length: usize,
}

impl Stream {
    /// Creates a new Stream over `bytes[start..start + length]`.
    ///
    /// A `length` of 0 means "up to the end of the buffer".
    pub fn new(bytes: impl Into<Bytes>, start: usize, length: usize) -> Self {
        let bytes = bytes.into();
        let available = bytes.len().saturating_sub(start);
        let length = if length == 0 {
            available
        } else {
            length.min(available)
        };

        Stream {
            bytes,
            pos: start,
            start,
            length,
        }
    }

    /// Creates a new Stream over a whole buffer.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self::new(bytes, 0, 0)
    }

    /// Returns the underlying buffer.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

impl BaseStream for Stream {
    fn length(&self) -> usize {
        self.length
    }

    fn start(&self) -> usize {
        self.start
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn set_pos(&mut self, pos: usize) -> PDFResult<()> {
        if pos < self.start || pos > self.start + self.length {
            return Err(PDFError::InvalidPosition {
                pos,
                length: self.length,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn get_byte(&mut self) -> PDFResult<u8> {
        if self.pos >= self.start + self.length {
            return Err(PDFError::UnexpectedEndOfStream);
        }
        let byte = self.bytes[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn get_bytes(&mut self, length: usize) -> PDFResult<Bytes> {
        let end_pos = (self.pos + length).min(self.start + self.length);
        let bytes = self.bytes.slice(self.pos..end_pos);
        self.pos = end_pos;
        Ok(bytes)
    }

    fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        if begin > end || begin < self.start || end > self.start + self.length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        Ok(self.bytes.slice(begin..end))
    }

    fn make_sub_stream(&self, start: usize, length: usize) -> PDFResult<Box<dyn BaseStream>> {
        if start + length > self.start + self.length {
            return Err(PDFError::InvalidByteRange {
                begin: start,
                end: start + length,
            });
        }

        Ok(Box::new(Stream {
            bytes: self.bytes.clone(),
            pos: start,
            start,
            length,
        }))
    }
}
