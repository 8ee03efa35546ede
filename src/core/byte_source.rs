//! Byte sources: where the raw document bytes come from.
//!
//! A source offers two ways of reading: ranged reads for on-demand loading
//! and a sequential full read used when ranges are unavailable. The
//! [`ChunkedStreamManager`](super::chunked_stream::ChunkedStreamManager)
//! decides which one to use.

use super::error::{PDFError, PDFResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Default size of one sequential read from a file source.
pub const DEFAULT_SEQUENTIAL_CHUNK: usize = 65536;

/// Loading progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressData {
    /// Bytes available so far
    pub loaded: usize,
    /// Total size, if known
    pub total: Option<usize>,
}

/// Progress callback for tracking download progress.
pub type ProgressCallback = Arc<dyn Fn(ProgressData) + Send + Sync>;

/// Capabilities reported by a source's probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    /// Total size in bytes, if the source knows it up front
    pub content_length: Option<usize>,
    /// Whether `read_range` may be used
    pub supports_range_requests: bool,
    /// File name suggested by the source (e.g. `Content-Disposition`)
    pub filename: Option<String>,
}

/// A cancellable source of document bytes.
///
/// Implementations must be safe to call concurrently: several range reads
/// may be in flight while the sequential read is being pumped.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Determines length and range support. Called once when the document
    /// is opened.
    async fn probe(&self) -> PDFResult<SourceInfo>;

    /// Reads `begin..end`.
    ///
    /// Sources that lose range support answer with
    /// [`PDFError::RangeRequestRejectedMidStream`].
    async fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes>;

    /// Returns the next piece of the sequential full read, `None` at the end.
    async fn read_next(&self) -> PDFResult<Option<Bytes>>;

    /// Aborts outstanding and future reads.
    fn cancel(&self, reason: &str);

    /// Drains the sequential read into one buffer.
    async fn read_all(&self) -> PDFResult<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.read_next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }
}

/// Shared cancellation flag with the reason of the first cancel.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelFlag {
    pub fn cancel(&self, reason: &str) {
        let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(reason.to_string());
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancelled.
    pub fn check(&self) -> PDFResult<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        Err(PDFError::Cancelled(reason))
    }
}

/// A source over bytes that are already in memory.
#[derive(Debug)]
pub struct MemorySource {
    data: Bytes,
    sequential_chunk: usize,
    cursor: AtomicUsize,
    cancel: CancelFlag,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        MemorySource {
            data: data.into(),
            sequential_chunk: DEFAULT_SEQUENTIAL_CHUNK,
            cursor: AtomicUsize::new(0),
            cancel: CancelFlag::default(),
        }
    }

    /// Sets the size of the pieces returned by `read_next`.
    pub fn with_sequential_chunk(mut self, size: usize) -> Self {
        self.sequential_chunk = size.max(1);
        self
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn probe(&self) -> PDFResult<SourceInfo> {
        self.cancel.check()?;
        Ok(SourceInfo {
            content_length: Some(self.data.len()),
            supports_range_requests: true,
            filename: None,
        })
    }

    async fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        self.cancel.check()?;
        if begin > end || end > self.data.len() {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        Ok(self.data.slice(begin..end))
    }

    async fn read_next(&self) -> PDFResult<Option<Bytes>> {
        self.cancel.check()?;
        let begin = self
            .cursor
            .fetch_add(self.sequential_chunk, Ordering::SeqCst)
            .min(self.data.len());
        let end = (begin + self.sequential_chunk).min(self.data.len());
        if begin >= end {
            return Ok(None);
        }
        Ok(Some(self.data.slice(begin..end)))
    }

    fn cancel(&self, reason: &str) {
        self.cancel.cancel(reason);
    }
}

/// A local file read through `tokio::fs`.
#[derive(Debug)]
pub struct FileSource {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    length: usize,
    sequential_chunk: usize,
    cursor: AtomicUsize,
    cancel: CancelFlag,
}

impl FileSource {
    /// Opens a file. A missing file is reported as `MissingDocument`.
    pub async fn open(path: impl AsRef<Path>) -> PDFResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PDFError::MissingDocument(format!("{}: {}", path.display(), e))
            }
            _ => PDFError::Unreachable(format!("{}: {}", path.display(), e)),
        })?;
        let metadata = file.metadata().await?;

        Ok(FileSource {
            path,
            file: tokio::sync::Mutex::new(file),
            length: metadata.len() as usize,
            sequential_chunk: DEFAULT_SEQUENTIAL_CHUNK,
            cursor: AtomicUsize::new(0),
            cancel: CancelFlag::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_at(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        let mut buf = vec![0u8; end - begin];
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(begin as u64)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl ByteSource for FileSource {
    async fn probe(&self) -> PDFResult<SourceInfo> {
        self.cancel.check()?;
        Ok(SourceInfo {
            content_length: Some(self.length),
            supports_range_requests: true,
            filename: self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        })
    }

    async fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        self.cancel.check()?;
        if begin > end || end > self.length {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        let data = self.read_at(begin, end).await?;
        self.cancel.check()?;
        Ok(data)
    }

    async fn read_next(&self) -> PDFResult<Option<Bytes>> {
        self.cancel.check()?;
        let begin = self
            .cursor
            .fetch_add(self.sequential_chunk, Ordering::SeqCst)
            .min(self.length);
        let end = (begin + self.sequential_chunk).min(self.length);
        if begin >= end {
            return Ok(None);
        }
        self.read_at(begin, end).await.map(Some)
    }

    fn cancel(&self, reason: &str) {
        self.cancel.cancel(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_memory_source_reads() {
        let source = MemorySource::new(b"0123456789".to_vec()).with_sequential_chunk(4);

        let info = source.probe().await.unwrap();
        assert_eq!(info.content_length, Some(10));
        assert!(info.supports_range_requests);

        assert_eq!(source.read_range(2, 5).await.unwrap().as_ref(), b"234");
        assert_eq!(source.read_all().await.unwrap().as_ref(), b"0123456789");
        assert_eq!(source.read_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_rejects_reads() {
        let source = MemorySource::new(b"abc".to_vec());
        source.cancel("closed");
        source.cancel("second reason is ignored");

        assert_eq!(
            source.read_range(0, 1).await,
            Err(PDFError::Cancelled("closed".into()))
        );
    }

    #[tokio::test]
    async fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"%PDF-1.7 body").unwrap();
        file.flush().unwrap();

        let source = FileSource::open(file.path()).await.unwrap();
        let info = source.probe().await.unwrap();
        assert_eq!(info.content_length, Some(13));
        assert_eq!(source.read_range(1, 4).await.unwrap().as_ref(), b"PDF");
        assert_eq!(source.read_all().await.unwrap().as_ref(), b"%PDF-1.7 body");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileSource::open(dir.path().join("absent.pdf")).await;
        assert!(matches!(result, Err(PDFError::MissingDocument(_))));
    }
}
