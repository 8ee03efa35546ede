use super::error::{PDFError, PDFResult};
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;

/// Default chunk size: 64KB
pub const DEFAULT_CHUNK_SIZE: usize = super::config::DEFAULT_CHUNK_SIZE;

/// Stores chunk data and tracks which chunks are loaded.
///
/// Chunks are aligned to `chunk_size`; the last one may be shorter. Data
/// arrives either as whole aligned runs of chunks (range requests) or as an
/// in-order byte stream starting at offset 0 (sequential reading). In the
/// sequential case the incomplete tail is kept in `partial` and is readable
/// before its chunk completes.
///
/// Loaded chunks are never evicted: parsed objects hold `Bytes` slices into
/// them and re-fetching would break the at-most-once loading guarantee.
#[derive(Debug)]
pub struct ChunkManager {
    /// Total length of the data in bytes
    total_length: usize,
    /// Size of each chunk in bytes
    chunk_size: usize,
    /// Total number of chunks
    num_chunks: usize,

    /// Loaded chunks (chunk_number -> data)
    chunks: FxHashMap<usize, Bytes>,

    /// Bytes of the sequential read not yet forming a whole chunk.
    partial: Vec<u8>,

    /// Number of bytes delivered by the sequential read so far.
    progressive_end: usize,
}

impl ChunkManager {
    /// Creates a new ChunkManager.
    ///
    /// # Arguments
    /// * `total_length` - Total length of the data
    /// * `chunk_size` - Size of each chunk (default: 64KB)
    pub fn new(total_length: usize, chunk_size: Option<usize>) -> Self {
        let chunk_size = chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1);
        let num_chunks = total_length.div_ceil(chunk_size);

        ChunkManager {
            total_length,
            chunk_size,
            num_chunks,
            chunks: FxHashMap::default(),
            partial: Vec::new(),
            progressive_end: 0,
        }
    }

    /// Returns the total length of the data.
    pub fn length(&self) -> usize {
        self.total_length
    }

    /// Returns the chunk size.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Returns the total number of chunks.
    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    /// Gets the chunk number for a given byte position.
    pub fn get_chunk_number(&self, pos: usize) -> usize {
        pos / self.chunk_size
    }

    /// Byte range covered by a chunk.
    pub fn chunk_range(&self, chunk_num: usize) -> (usize, usize) {
        let begin = chunk_num * self.chunk_size;
        let end = (begin + self.chunk_size).min(self.total_length);
        (begin, end)
    }

    /// Stores data received for the aligned range starting at `begin`.
    ///
    /// `begin` must be a chunk boundary; the data may span several chunks and
    /// must end on a chunk boundary or at the end of the file. Returns the
    /// chunk numbers that became available.
    pub fn on_receive_data(&mut self, begin: usize, data: Bytes) -> PDFResult<Vec<usize>> {
        let end = begin + data.len();
        if begin % self.chunk_size != 0 || end > self.total_length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        if end % self.chunk_size != 0 && end != self.total_length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }

        let first_chunk = begin / self.chunk_size;
        let mut loaded = Vec::new();
        let mut offset = 0;
        let mut chunk_num = first_chunk;
        while offset < data.len() {
            let chunk_end = (offset + self.chunk_size).min(data.len());
            if !self.chunks.contains_key(&chunk_num) {
                self.chunks.insert(chunk_num, data.slice(offset..chunk_end));
                loaded.push(chunk_num);
            }
            offset = chunk_end;
            chunk_num += 1;
        }
        Ok(loaded)
    }

    /// Appends bytes from the sequential read.
    ///
    /// Returns the chunk numbers completed by this data.
    pub fn on_receive_progressive_data(&mut self, data: &[u8]) -> Vec<usize> {
        let mut loaded = Vec::new();
        let remaining = self.total_length.saturating_sub(self.progressive_end);
        let data = &data[..data.len().min(remaining)];
        self.partial.extend_from_slice(data);
        self.progressive_end += data.len();

        loop {
            let chunk_num = (self.progressive_end - self.partial.len()) / self.chunk_size;
            let (begin, end) = self.chunk_range(chunk_num);
            let needed = end - begin;
            if needed == 0 || self.partial.len() < needed {
                break;
            }
            let chunk: Vec<u8> = self.partial.drain(..needed).collect();
            if !self.chunks.contains_key(&chunk_num) {
                self.chunks.insert(chunk_num, Bytes::from(chunk));
                loaded.push(chunk_num);
            }
        }
        loaded
    }

    /// Bytes delivered by the sequential read so far.
    pub fn progressive_end(&self) -> usize {
        self.progressive_end
    }

    /// Checks if a specific chunk has been loaded.
    pub fn has_chunk(&self, chunk: usize) -> bool {
        self.chunks.contains_key(&chunk)
    }

    /// Data of a loaded chunk.
    pub fn chunk(&self, chunk: usize) -> Option<&Bytes> {
        self.chunks.get(&chunk)
    }

    /// Returns a list of chunk numbers that have not been loaded.
    pub fn get_missing_chunks(&self) -> Vec<usize> {
        (0..self.num_chunks)
            .filter(|chunk| !self.chunks.contains_key(chunk))
            .collect()
    }

    /// Missing chunks overlapping `begin..end`.
    ///
    /// Bytes already covered by the sequential read's partial tail are
    /// treated as present.
    pub fn get_missing_chunks_in_range(&self, begin: usize, end: usize) -> Vec<usize> {
        let end = end.min(self.total_length);
        if begin >= end {
            return Vec::new();
        }
        let first = self.get_chunk_number(begin);
        let last = self.get_chunk_number(end - 1);
        (first..=last)
            .filter(|&chunk| !self.is_range_readable(chunk, begin, end))
            .collect()
    }

    fn is_range_readable(&self, chunk: usize, begin: usize, end: usize) -> bool {
        if self.chunks.contains_key(&chunk) {
            return true;
        }
        let (chunk_begin, chunk_end) = self.chunk_range(chunk);
        let needed_end = end.min(chunk_end);
        let needed_begin = begin.max(chunk_begin);
        let partial_begin = self.progressive_end - self.partial.len();
        needed_begin >= partial_begin && needed_end <= self.progressive_end
    }

    /// Returns the next unloaded chunk starting from `begin_chunk`, with wraparound.
    pub fn next_empty_chunk(&self, begin_chunk: usize) -> Option<usize> {
        (0..self.num_chunks)
            .map(|i| (begin_chunk + i) % self.num_chunks)
            .find(|chunk| !self.chunks.contains_key(chunk))
    }

    /// Returns the number of chunks loaded.
    pub fn num_chunks_loaded(&self) -> usize {
        self.chunks.len()
    }

    /// Number of bytes currently readable.
    pub fn bytes_loaded(&self) -> usize {
        let chunk_bytes: usize = self.chunks.values().map(Bytes::len).sum();
        chunk_bytes + self.partial.len()
    }

    /// Returns true if all chunks have been loaded.
    pub fn is_data_loaded(&self) -> bool {
        self.chunks.len() == self.num_chunks
    }

    /// Reads one byte, or `DataMissing` if it is not loaded yet.
    pub fn get_byte(&self, pos: usize) -> PDFResult<u8> {
        if pos >= self.total_length {
            return Err(PDFError::UnexpectedEndOfStream);
        }
        let chunk_num = self.get_chunk_number(pos);
        if let Some(chunk) = self.chunks.get(&chunk_num) {
            return Ok(chunk[pos - chunk_num * self.chunk_size]);
        }
        let partial_begin = self.progressive_end - self.partial.len();
        if pos >= partial_begin && pos < self.progressive_end {
            return Ok(self.partial[pos - partial_begin]);
        }
        Err(PDFError::DataMissing {
            position: pos,
            length: 1,
        })
    }

    /// Reads `begin..end`, or `DataMissing` covering the whole range.
    ///
    /// Ranges inside a single chunk are returned without copying.
    pub fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        if begin > end || end > self.total_length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        if begin == end {
            return Ok(Bytes::new());
        }
        if !self.get_missing_chunks_in_range(begin, end).is_empty() {
            return Err(PDFError::DataMissing {
                position: begin,
                length: end - begin,
            });
        }

        let first = self.get_chunk_number(begin);
        let last = self.get_chunk_number(end - 1);
        if first == last {
            if let Some(chunk) = self.chunks.get(&first) {
                let base = first * self.chunk_size;
                return Ok(chunk.slice(begin - base..end - base));
            }
        }

        let mut out = BytesMut::with_capacity(end - begin);
        let partial_begin = self.progressive_end - self.partial.len();
        for chunk_num in first..=last {
            let (chunk_begin, chunk_end) = self.chunk_range(chunk_num);
            let from = begin.max(chunk_begin);
            let to = end.min(chunk_end);
            match self.chunks.get(&chunk_num) {
                Some(chunk) => out.extend_from_slice(&chunk[from - chunk_begin..to - chunk_begin]),
                None => out.extend_from_slice(&self.partial[from - partial_begin..to - partial_begin]),
            }
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_creation() {
        let manager = ChunkManager::new(1024, None);

        assert_eq!(manager.length(), 1024);
        assert_eq!(manager.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(manager.num_chunks(), 1);
    }

    #[test]
    fn test_on_receive_data_splits_runs() {
        let mut manager = ChunkManager::new(250, Some(100));

        assert_eq!(manager.num_chunks_loaded(), 0);
        let loaded = manager
            .on_receive_data(100, Bytes::from(vec![1u8; 150]))
            .unwrap();

        assert_eq!(loaded, vec![1, 2]);
        assert!(manager.has_chunk(1));
        assert!(manager.has_chunk(2));
        assert!(!manager.has_chunk(0));
    }

    #[test]
    fn test_unaligned_data_rejected() {
        let mut manager = ChunkManager::new(300, Some(100));
        assert!(manager.on_receive_data(50, Bytes::from(vec![0u8; 50])).is_err());
        assert!(manager.on_receive_data(0, Bytes::from(vec![0u8; 50])).is_err());
    }

    #[test]
    fn test_get_missing_chunks() {
        let mut manager = ChunkManager::new(300, Some(100));

        assert_eq!(manager.get_missing_chunks(), vec![0, 1, 2]);

        manager
            .on_receive_data(100, Bytes::from(vec![1u8; 100]))
            .unwrap();

        assert_eq!(manager.get_missing_chunks(), vec![0, 2]);
        assert_eq!(manager.get_missing_chunks_in_range(150, 250), vec![2]);
        assert!(manager.get_missing_chunks_in_range(120, 180).is_empty());
    }

    #[test]
    fn test_next_empty_chunk() {
        let mut manager = ChunkManager::new(300, Some(100));

        manager.on_receive_data(0, Bytes::from(vec![0u8; 100])).unwrap();
        manager.on_receive_data(200, Bytes::from(vec![2u8; 100])).unwrap();

        assert_eq!(manager.next_empty_chunk(0), Some(1));
        assert_eq!(manager.next_empty_chunk(2), Some(1));

        manager.on_receive_data(100, Bytes::from(vec![1u8; 100])).unwrap();

        assert_eq!(manager.next_empty_chunk(0), None);
        assert!(manager.is_data_loaded());
    }

    #[test]
    fn test_read_range_reports_missing_data() {
        let mut manager = ChunkManager::new(300, Some(100));
        manager
            .on_receive_data(0, Bytes::from((0..100).collect::<Vec<u8>>()))
            .unwrap();

        assert_eq!(manager.read_range(10, 13).unwrap().as_ref(), &[10, 11, 12]);
        assert_eq!(manager.get_byte(99).unwrap(), 99);
        assert_eq!(
            manager.read_range(90, 110),
            Err(PDFError::DataMissing {
                position: 90,
                length: 20
            })
        );
        assert_eq!(
            manager.get_byte(150),
            Err(PDFError::DataMissing {
                position: 150,
                length: 1
            })
        );
        assert_eq!(manager.get_byte(300), Err(PDFError::UnexpectedEndOfStream));
    }

    #[test]
    fn test_read_range_across_chunks() {
        let mut manager = ChunkManager::new(250, Some(100));
        let data: Vec<u8> = (0..250).map(|i| i as u8).collect();
        manager.on_receive_data(0, Bytes::from(data.clone())).unwrap();

        assert_eq!(manager.read_range(95, 205).unwrap().as_ref(), &data[95..205]);
    }

    #[test]
    fn test_progressive_data() {
        let mut manager = ChunkManager::new(250, Some(100));
        let data: Vec<u8> = (0..250).map(|i| i as u8).collect();

        assert!(manager.on_receive_progressive_data(&data[..60]).is_empty());
        // Partial tail is readable before the chunk completes.
        assert_eq!(manager.get_byte(59).unwrap(), 59);
        assert!(manager.get_missing_chunks_in_range(0, 60).is_empty());
        assert_eq!(manager.get_missing_chunks_in_range(0, 61), vec![0]);

        assert_eq!(manager.on_receive_progressive_data(&data[60..210]), vec![0, 1]);
        assert_eq!(manager.read_range(190, 210).unwrap().as_ref(), &data[190..210]);

        assert_eq!(manager.on_receive_progressive_data(&data[210..]), vec![2]);
        assert!(manager.is_data_loaded());
        assert_eq!(manager.bytes_loaded(), 250);
    }
}
