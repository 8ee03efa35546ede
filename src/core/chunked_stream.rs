//! On-demand loading of a byte source in fixed-size chunks.
//!
//! [`ChunkedStreamManager`] owns the [`ByteSource`] and the [`ChunkManager`]
//! bookkeeping for one document. Parsers read through [`ChunkedStream`], a
//! synchronous [`BaseStream`] view that raises `DataMissing` for bytes that
//! have not arrived; the async drivers then call
//! [`ChunkedStreamManager::ensure_range`] and retry.

use super::base_stream::BaseStream;
use super::byte_source::{ByteSource, CancelFlag, ProgressCallback, ProgressData};
use super::chunk_manager::ChunkManager;
use super::config::LoadOptions;
use super::diagnostics::{Diagnostics, WarningKind};
use super::error::{PDFError, PDFResult};
use super::pending::{Awaiter, PendingValue};
use bytes::Bytes;
use log::{debug, info};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How missing bytes are obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Ranged reads of whole chunk runs.
    Range,
    /// One in-order read of the whole source.
    Sequential,
}

struct LoaderState {
    chunks: ChunkManager,
    /// One pending value per chunk with a range request in flight.
    in_flight: FxHashMap<usize, PendingValue<()>>,
    mode: LoadMode,
}

/// Loads chunks of a byte source on demand.
pub struct ChunkedStreamManager {
    source: Arc<dyn ByteSource>,
    state: Mutex<LoaderState>,
    /// Serializes the sequential pump.
    pump: tokio::sync::Mutex<()>,
    length: usize,
    chunk_size: usize,
    cancel: CancelFlag,
    progress: Option<ProgressCallback>,
    diagnostics: Diagnostics,
    range_requests: AtomicUsize,
    sequential_reads: AtomicUsize,
}

impl ChunkedStreamManager {
    /// Probes `source` and sets up chunk bookkeeping.
    ///
    /// A source that cannot report its length is read completely up front.
    pub async fn open(
        source: Arc<dyn ByteSource>,
        options: &LoadOptions,
        diagnostics: Diagnostics,
    ) -> PDFResult<Arc<Self>> {
        let info = source.probe().await?;
        debug!(
            "Source probe: length={:?} ranges={} filename={:?}",
            info.content_length, info.supports_range_requests, info.filename
        );

        let mut preloaded = None;
        let length = match info.content_length {
            Some(length) => length,
            None => {
                let data = source.read_all().await?;
                let length = data.len();
                preloaded = Some(data);
                length
            }
        };

        let mode = if options.disable_range || !info.supports_range_requests {
            LoadMode::Sequential
        } else {
            LoadMode::Range
        };

        let mut chunks = ChunkManager::new(length, Some(options.range_chunk_size));
        let chunk_size = chunks.chunk_size();
        if let Some(data) = preloaded {
            chunks.on_receive_progressive_data(&data);
        }

        let manager = Arc::new(ChunkedStreamManager {
            source,
            state: Mutex::new(LoaderState {
                chunks,
                in_flight: FxHashMap::default(),
                mode,
            }),
            pump: tokio::sync::Mutex::new(()),
            length,
            chunk_size,
            cancel: CancelFlag::default(),
            progress: options.progress.clone(),
            diagnostics,
            range_requests: AtomicUsize::new(0),
            sequential_reads: AtomicUsize::new(0),
        });

        if options.stream_in_background && mode == LoadMode::Range {
            let background = Arc::clone(&manager);
            tokio::spawn(async move {
                if let Err(e) = background.pump_until(0, background.length).await {
                    debug!("Background read stopped: {}", e);
                }
            });
        }

        Ok(manager)
    }

    fn lock(&self) -> MutexGuard<'_, LoaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Total length of the source.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn mode(&self) -> LoadMode {
        self.lock().mode
    }

    /// Number of ranged reads issued so far.
    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }

    /// Number of sequential reads pulled so far.
    pub fn sequential_reads(&self) -> usize {
        self.sequential_reads.load(Ordering::SeqCst)
    }

    pub fn bytes_loaded(&self) -> usize {
        self.lock().chunks.bytes_loaded()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.lock().chunks.is_data_loaded()
    }

    pub fn missing_chunks(&self) -> Vec<usize> {
        self.lock().chunks.get_missing_chunks()
    }

    /// A synchronous view over the whole source.
    pub fn stream(self: &Arc<Self>) -> ChunkedStream {
        ChunkedStream {
            manager: Arc::clone(self),
            pos: 0,
            start: 0,
            length: self.length,
            cached_chunk: None,
        }
    }

    /// Reads loaded bytes without waiting.
    pub fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        self.lock().chunks.read_range(begin, end)
    }

    /// Loads `begin..end` if needed and returns it.
    pub async fn get_range(self: &Arc<Self>, begin: usize, end: usize) -> PDFResult<Bytes> {
        self.ensure_range(begin, end).await?;
        self.read_range(begin, end.min(self.length))
    }

    /// Loads the whole source.
    pub async fn ensure_all(self: &Arc<Self>) -> PDFResult<()> {
        self.ensure_range(0, self.length).await
    }

    /// Makes `begin..end` readable.
    ///
    /// In range mode missing chunks are fetched in contiguous runs on spawned
    /// tasks, joining requests already in flight. When the source stops
    /// honouring ranges the manager switches to sequential mode for good and
    /// satisfies the request from the sequential read.
    pub async fn ensure_range(self: &Arc<Self>, begin: usize, end: usize) -> PDFResult<()> {
        self.cancel.check()?;
        let end = end.min(self.length);
        if begin >= end {
            return Ok(());
        }

        loop {
            let mode = self.mode();
            let result = match mode {
                LoadMode::Range => self.ensure_by_range_requests(begin, end).await,
                LoadMode::Sequential => return self.pump_until(begin, end).await,
            };
            match result {
                Err(PDFError::RangeRequestRejectedMidStream(reason)) => {
                    self.fall_back_to_sequential(&reason);
                }
                other => return other,
            }
        }
    }

    async fn ensure_by_range_requests(self: &Arc<Self>, begin: usize, end: usize) -> PDFResult<()> {
        let waits = {
            let mut state = self.lock();
            let missing = state.chunks.get_missing_chunks_in_range(begin, end);
            if missing.is_empty() {
                return Ok(());
            }

            let mut waits = Vec::with_capacity(missing.len());
            let mut to_request = Vec::new();
            for chunk in missing {
                if let Some(pending) = state.in_flight.get(&chunk) {
                    waits.push(pending.clone());
                    continue;
                }
                let pending = PendingValue::new(format!("chunk {}", chunk));
                state.in_flight.insert(chunk, pending.clone());
                waits.push(pending);
                to_request.push(chunk);
            }

            for (first, last) in contiguous_runs(&to_request) {
                // The task holds its own awaiters so a requester giving up
                // never abandons a chunk other readers are waiting for.
                let holds: Vec<Awaiter<()>> = (first..=last)
                    .filter_map(|chunk| state.in_flight.get(&chunk).map(PendingValue::awaiter))
                    .collect();
                let (run_begin, _) = state.chunks.chunk_range(first);
                let (_, run_end) = state.chunks.chunk_range(last);
                self.spawn_range_request(first, last, run_begin, run_end, holds);
            }
            waits
        };

        for pending in waits {
            pending.wait().await?;
        }
        Ok(())
    }

    fn spawn_range_request(
        self: &Arc<Self>,
        first: usize,
        last: usize,
        begin: usize,
        end: usize,
        holds: Vec<Awaiter<()>>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.range_requests.fetch_add(1, Ordering::SeqCst);
            debug!("Range request {}..{} (chunks {}..={})", begin, end, first, last);

            let result = match manager.source.read_range(begin, end).await {
                Ok(data) => manager.receive_range(begin, data),
                Err(e) => Err(e),
            };

            let settled: Vec<_> = {
                let mut state = manager.lock();
                (first..=last)
                    .filter_map(|chunk| state.in_flight.remove(&chunk))
                    .collect()
            };
            for pending in settled {
                let _ = pending.settle(result.clone());
            }
            drop(holds);
        });
    }

    fn receive_range(&self, begin: usize, data: Bytes) -> PDFResult<()> {
        let loaded = {
            let mut state = self.lock();
            state.chunks.on_receive_data(begin, data)?;
            state.chunks.bytes_loaded()
        };
        self.report_progress(loaded);
        Ok(())
    }

    fn fall_back_to_sequential(&self, reason: &str) {
        let mut state = self.lock();
        if state.mode == LoadMode::Sequential {
            return;
        }
        state.mode = LoadMode::Sequential;
        drop(state);
        self.diagnostics.warn(
            WarningKind::RangeFallback,
            format!("Range requests disabled, reading sequentially: {}", reason),
        );
    }

    /// Pulls the sequential read until `begin..end` is covered.
    async fn pump_until(&self, begin: usize, end: usize) -> PDFResult<()> {
        let _pump = self.pump.lock().await;
        loop {
            let covered = self
                .lock()
                .chunks
                .get_missing_chunks_in_range(begin, end)
                .is_empty();
            if covered {
                return Ok(());
            }
            self.cancel.check()?;

            let next = self.source.read_next().await?;
            self.sequential_reads.fetch_add(1, Ordering::SeqCst);
            let Some(data) = next else {
                let loaded = self.lock().chunks.progressive_end();
                return Err(PDFError::StreamError(format!(
                    "Sequential read ended at {} before {}..{} was available",
                    loaded, begin, end
                )));
            };

            let loaded = {
                let mut state = self.lock();
                state.chunks.on_receive_progressive_data(&data);
                state.chunks.bytes_loaded()
            };
            self.report_progress(loaded);
        }
    }

    fn report_progress(&self, loaded: usize) {
        if let Some(progress) = &self.progress {
            progress(ProgressData {
                loaded,
                total: Some(self.length),
            });
        }
    }

    /// Aborts outstanding reads and rejects every waiting chunk.
    pub fn cancel(&self, reason: &str) {
        info!("Cancelling loader: {}", reason);
        self.cancel.cancel(reason);
        self.source.cancel(reason);
        let in_flight: Vec<_> = self.lock().in_flight.drain().map(|(_, p)| p).collect();
        for pending in in_flight {
            pending.cancel(PDFError::Cancelled(reason.to_string()));
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// `Err(Cancelled)` with the cancel reason once cancelled.
    pub fn check_cancelled(&self) -> PDFResult<()> {
        self.cancel.check()
    }
}

/// Groups sorted chunk numbers into inclusive `(first, last)` runs.
fn contiguous_runs(chunks: &[usize]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for &chunk in chunks {
        match runs.last_mut() {
            Some((_, last)) if *last + 1 == chunk => *last = chunk,
            _ => runs.push((chunk, chunk)),
        }
    }
    runs
}

/// Synchronous view over a [`ChunkedStreamManager`].
///
/// Reads of bytes that are not loaded fail with `DataMissing` and leave the
/// position unchanged.
pub struct ChunkedStream {
    manager: Arc<ChunkedStreamManager>,
    pos: usize,
    start: usize,
    length: usize,
    /// Last full chunk read from; loaded chunks never change.
    cached_chunk: Option<(usize, Bytes)>,
}

impl ChunkedStream {
    pub fn manager(&self) -> &Arc<ChunkedStreamManager> {
        &self.manager
    }
}

impl BaseStream for ChunkedStream {
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
        if pos < self.start || pos > self.end() {
            return Err(PDFError::InvalidPosition {
                pos,
                length: self.length,
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn is_data_loaded(&self) -> bool {
        self.manager.is_fully_loaded()
    }

    fn get_byte(&mut self) -> PDFResult<u8> {
        if self.pos >= self.end() {
            return Err(PDFError::UnexpectedEndOfStream);
        }
        let chunk_size = self.manager.chunk_size;
        let chunk_num = self.pos / chunk_size;
        if let Some((cached, data)) = &self.cached_chunk {
            if *cached == chunk_num {
                let byte = data[self.pos - chunk_num * chunk_size];
                self.pos += 1;
                return Ok(byte);
            }
        }

        let state = self.manager.lock();
        let byte = match state.chunks.chunk(chunk_num) {
            Some(data) => {
                let byte = data[self.pos - chunk_num * chunk_size];
                self.cached_chunk = Some((chunk_num, data.clone()));
                byte
            }
            None => state.chunks.get_byte(self.pos)?,
        };
        drop(state);
        self.pos += 1;
        Ok(byte)
    }

    fn get_bytes(&mut self, length: usize) -> PDFResult<Bytes> {
        let end = (self.pos + length).min(self.end());
        let data = self.manager.read_range(self.pos, end)?;
        self.pos = end;
        Ok(data)
    }

    fn get_byte_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
        if begin > end || begin < self.start || end > self.end() {
            return Err(PDFError::InvalidByteRange { begin, end });
        }
        self.manager.read_range(begin, end)
    }

    fn make_sub_stream(&self, start: usize, length: usize) -> PDFResult<Box<dyn BaseStream>> {
        if start + length > self.end() {
            return Err(PDFError::InvalidByteRange {
                begin: start,
                end: start + length,
            });
        }
        Ok(Box::new(ChunkedStream {
            manager: Arc::clone(&self.manager),
            pos: start,
            start,
            length,
            cached_chunk: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::byte_source::{MemorySource, SourceInfo};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Memory source that counts reads and can start refusing ranges.
    struct CountingSource {
        inner: MemorySource,
        ranges: Mutex<Vec<(usize, usize)>>,
        reject_ranges: AtomicBool,
    }

    impl CountingSource {
        fn new(data: Vec<u8>) -> Self {
            CountingSource {
                inner: MemorySource::new(data).with_sequential_chunk(100),
                ranges: Mutex::new(Vec::new()),
                reject_ranges: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ByteSource for CountingSource {
        async fn probe(&self) -> PDFResult<SourceInfo> {
            self.inner.probe().await
        }

        async fn read_range(&self, begin: usize, end: usize) -> PDFResult<Bytes> {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if self.reject_ranges.load(Ordering::SeqCst) {
                return Err(PDFError::RangeRequestRejectedMidStream("downgraded".into()));
            }
            self.ranges.lock().unwrap().push((begin, end));
            self.inner.read_range(begin, end).await
        }

        async fn read_next(&self) -> PDFResult<Option<Bytes>> {
            self.inner.read_next().await
        }

        fn cancel(&self, reason: &str) {
            self.inner.cancel(reason);
        }
    }

    fn options(chunk: usize) -> LoadOptions {
        LoadOptions::default().with_chunk_size(chunk)
    }

    #[tokio::test]
    async fn test_stream_raises_data_missing_until_loaded() {
        let source = Arc::new(MemorySource::new(sample(1000)));
        let manager = ChunkedStreamManager::open(source, &options(100), Diagnostics::new())
            .await
            .unwrap();
        let mut stream = manager.stream();

        stream.set_pos(250).unwrap();
        assert_eq!(
            stream.get_byte(),
            Err(PDFError::DataMissing {
                position: 250,
                length: 1
            })
        );
        assert_eq!(stream.pos(), 250);

        manager.ensure_range(250, 260).await.unwrap();
        assert_eq!(stream.get_byte().unwrap(), (250 % 251) as u8);
        assert_eq!(manager.missing_chunks().len(), 9);
    }

    #[tokio::test]
    async fn test_contiguous_missing_chunks_share_one_request() {
        let source = Arc::new(CountingSource::new(sample(1000)));
        let manager =
            ChunkedStreamManager::open(source.clone(), &options(100), Diagnostics::new())
                .await
                .unwrap();

        manager.ensure_range(150, 420).await.unwrap();
        assert_eq!(*source.ranges.lock().unwrap(), vec![(100, 500)]);

        manager.ensure_range(0, 1000).await.unwrap();
        let mut ranges = source.ranges.lock().unwrap().clone();
        ranges.sort();
        assert_eq!(ranges, vec![(0, 100), (100, 500), (500, 1000)]);
        assert!(manager.is_fully_loaded());
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let source = Arc::new(CountingSource::new(sample(1000)));
        let manager =
            ChunkedStreamManager::open(source.clone(), &options(100), Diagnostics::new())
                .await
                .unwrap();

        let (a, b) = tokio::join!(manager.ensure_range(0, 200), manager.ensure_range(50, 150));
        a.unwrap();
        b.unwrap();
        assert_eq!(source.ranges.lock().unwrap().len(), 1);
        assert_eq!(manager.range_requests(), 1);
    }

    #[tokio::test]
    async fn test_fallback_to_sequential() {
        let source = Arc::new(CountingSource::new(sample(1000)));
        let diagnostics = Diagnostics::new();
        let manager = ChunkedStreamManager::open(source.clone(), &options(100), diagnostics.clone())
            .await
            .unwrap();

        manager.ensure_range(0, 100).await.unwrap();
        source.reject_ranges.store(true, Ordering::SeqCst);

        manager.ensure_range(600, 700).await.unwrap();
        assert_eq!(manager.mode(), LoadMode::Sequential);
        assert!(diagnostics.has(WarningKind::RangeFallback));
        assert_eq!(manager.read_range(600, 603).unwrap().as_ref(), &sample(1000)[600..603]);
        // Sequential read stops once the request is covered.
        assert!(!manager.is_fully_loaded());
    }

    #[tokio::test]
    async fn test_disable_range_reads_sequentially() {
        let source = Arc::new(CountingSource::new(sample(450)));
        let manager = ChunkedStreamManager::open(
            source.clone(),
            &options(100).with_disable_range(true),
            Diagnostics::new(),
        )
        .await
        .unwrap();

        manager.ensure_range(0, 150).await.unwrap();
        assert!(source.ranges.lock().unwrap().is_empty());
        assert_eq!(manager.sequential_reads(), 2);

        manager.ensure_all().await.unwrap();
        assert!(manager.is_fully_loaded());
    }

    #[tokio::test]
    async fn test_cancel_rejects_reads() {
        let source = Arc::new(MemorySource::new(sample(300)));
        let manager = ChunkedStreamManager::open(source, &options(100), Diagnostics::new())
            .await
            .unwrap();

        manager.cancel("closed");
        assert!(matches!(
            manager.ensure_range(0, 10).await,
            Err(PDFError::Cancelled(_))
        ));
    }

    #[test]
    fn test_contiguous_runs() {
        assert_eq!(contiguous_runs(&[1, 2, 3, 7, 9, 10]), vec![(1, 3), (7, 7), (9, 10)]);
        assert!(contiguous_runs(&[]).is_empty());
    }
}
