use super::error::PDFResult;
use bytes::Bytes;

/// Base trait for all PDF stream types.
///
/// Provides a uniform synchronous view over bytes that may come from memory
/// or from a partially loaded source. Positions are absolute offsets into the
/// underlying data, so sub-streams report the same positions as their parent.
///
/// A progressively loaded stream answers with
/// [`PDFError::DataMissing`](super::error::PDFError::DataMissing) when a byte
/// is not available yet; callers await the range and retry.
pub trait BaseStream: Send {
    // ============================================================================
    // Required methods (must be implemented by all stream types)
    // ============================================================================

    /// Returns the total length of the stream in bytes.
    fn length(&self) -> usize;

    /// Returns the absolute offset of the first byte of this stream.
    fn start(&self) -> usize;

    /// Returns the current position in the stream.
    fn pos(&self) -> usize;

    /// Sets the current position in the stream.
    fn set_pos(&mut self, pos: usize) -> PDFResult<()>;

    /// Reads and returns a single byte from the stream, advancing the position.
    ///
    /// Returns `UnexpectedEndOfStream` at the end and `DataMissing` when the
    /// byte has not been loaded yet.
    fn get_byte(&mut self) -> PDFResult<u8>;

    /// Reads up to `length` bytes from the stream, advancing the position.
    ///
    /// Fewer bytes are returned only at the end of the stream.
    fn get_bytes(&mut self, length: usize) -> PDFResult<Bytes>;

    /// Returns a range of bytes from the stream without changing the current position.
    ///
    /// # Arguments
    /// * `begin` - Starting byte offset (inclusive)
    /// * `end` - Ending byte offset (exclusive)
    fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Bytes>;

    /// Creates a sub-stream sharing this stream's data.
    ///
    /// # Arguments
    /// * `start` - Absolute starting offset for the sub-stream
    /// * `length` - Length of the sub-stream
    fn make_sub_stream(&self, start: usize, length: usize) -> PDFResult<Box<dyn BaseStream>>;

    // ============================================================================
    // Provided methods with default implementations
    // ============================================================================

    /// Returns true if the stream contains no data.
    fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Absolute offset one past the last byte.
    fn end(&self) -> usize {
        self.start() + self.length()
    }

    /// Returns true if all data in the stream is loaded.
    fn is_data_loaded(&self) -> bool {
        true
    }

    /// Resets the stream to its initial position.
    fn reset(&mut self) -> PDFResult<()> {
        self.set_pos(self.start())
    }

    /// Reads a single byte without advancing the position.
    fn peek_byte(&mut self) -> PDFResult<u8> {
        let current_pos = self.pos();
        let byte = self.get_byte()?;
        self.set_pos(current_pos)?;
        Ok(byte)
    }

    /// Reads the specified number of bytes without advancing the position.
    fn peek_bytes(&mut self, length: usize) -> PDFResult<Bytes> {
        let current_pos = self.pos();
        let bytes = self.get_bytes(length)?;
        self.set_pos(current_pos)?;
        Ok(bytes)
    }

    /// Skips `n` bytes in the stream by advancing the position.
    fn skip(&mut self, n: usize) -> PDFResult<()> {
        let target = (self.pos() + n).min(self.end());
        self.set_pos(target)
    }
}
