use super::byte_source::ProgressCallback;
use std::fmt;
use std::time::Duration;

/// Default chunk size for range requests (64KB)
pub const DEFAULT_CHUNK_SIZE: usize = 65536;

/// Maximum number of data-missing retries for a single operation.
pub const DEFAULT_MAX_RETRIES: usize = 512;

/// Number of compiled operator lists kept per document.
pub const DEFAULT_PAGE_CACHE_SIZE: usize = 16;

/// Maximum nesting of form XObjects.
pub const DEFAULT_MAX_FORM_DEPTH: usize = 12;

/// Options controlling how a document is loaded.
#[derive(Clone)]
pub struct LoadOptions {
    /// Size of one range request, rounded up to whole chunks.
    pub range_chunk_size: usize,

    /// Never issue range requests, read the source sequentially.
    pub disable_range: bool,

    /// Keep a sequential full read running in the background while range
    /// requests serve on-demand data.
    pub stream_in_background: bool,

    /// User or owner password for encrypted documents.
    pub password: Option<Vec<u8>>,

    /// Maximum data-missing retries for one operation.
    pub max_retries: usize,

    /// Capacity of the compiled operator-list LRU.
    pub page_cache_size: usize,

    /// Maximum form XObject nesting depth.
    pub max_form_depth: usize,

    /// Extra headers sent with every HTTP request.
    pub http_headers: Vec<(String, String)>,

    /// Timeout for a single HTTP request.
    pub request_timeout: Duration,

    /// Called with `(loaded, total)` whenever new bytes arrive.
    pub progress: Option<ProgressCallback>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions {
            range_chunk_size: DEFAULT_CHUNK_SIZE,
            disable_range: false,
            stream_in_background: false,
            password: None,
            max_retries: DEFAULT_MAX_RETRIES,
            page_cache_size: DEFAULT_PAGE_CACHE_SIZE,
            max_form_depth: DEFAULT_MAX_FORM_DEPTH,
            http_headers: Vec::new(),
            request_timeout: Duration::from_secs(30),
            progress: None,
        }
    }
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, password: impl AsRef<[u8]>) -> Self {
        self.password = Some(password.as_ref().to_vec());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.range_chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_disable_range(mut self, disable: bool) -> Self {
        self.disable_range = disable;
        self
    }

    pub fn with_background_stream(mut self, enabled: bool) -> Self {
        self.stream_in_background = enabled;
        self
    }

    pub fn with_page_cache_size(mut self, size: usize) -> Self {
        self.page_cache_size = size;
        self
    }

    pub fn with_max_form_depth(mut self, depth: usize) -> Self {
        self.max_form_depth = depth;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.http_headers.push((name.into(), value.into()));
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }
}

impl fmt::Debug for LoadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadOptions")
            .field("range_chunk_size", &self.range_chunk_size)
            .field("disable_range", &self.disable_range)
            .field("stream_in_background", &self.stream_in_background)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .field("page_cache_size", &self.page_cache_size)
            .field("max_form_depth", &self.max_form_depth)
            .field("http_headers", &self.http_headers)
            .field("request_timeout", &self.request_timeout)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
