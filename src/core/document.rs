use super::byte_source::{ByteSource, FileSource, MemorySource};
use super::chunked_stream::ChunkedStreamManager;
use super::config::LoadOptions;
use super::content_stream::OperatorList;
use super::diagnostics::{Diagnostics, WarningKind};
use super::encryption::Permissions;
use super::error::{PDFError, PDFResult};
use super::evaluator::ContentInterpreter;
use super::filter::FilterRegistry;
use super::object_store::{ObjectStore, StoreStats};
use super::page::{Page, PageTree};
use super::pending::PendingTable;
use super::primitives::{Dict, PDFObject, Ref};
use super::resources::{ResourceResolver, ResourceScope, ScopeFrame};
use bytes::{Bytes, BytesMut};
use log::{debug, info};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// PDF Document reader.
///
/// This is the main entry point for reading PDF documents. Opening reads
/// the cross-reference data, the security handler and the catalog; pages
/// and objects are resolved lazily afterwards, loading only the bytes
/// they need.
///
/// Cloning is cheap and yields another handle onto the same document.
///
/// Based on PDF.js's PDFDocument class.
#[derive(Clone)]
pub struct PDFDocument {
    inner: Arc<DocumentInner>,
}

struct DocumentInner {
    store: Arc<ObjectStore>,
    resolver: Arc<ResourceResolver>,
    catalog: Dict,
    pages: PageTree,
    options: LoadOptions,
    diagnostics: Diagnostics,
    /// Compiled operator lists, most recently used first
    lists: Mutex<LruCache<usize, Arc<OperatorList>>>,
    compiles: PendingTable<usize, Arc<OperatorList>>,
}

/// An operator list being compiled in the background.
///
/// Dropping the task does not stop it; [`cancel`](Self::cancel) does,
/// unless another caller waits for the same page.
pub struct PageTask {
    index: usize,
    handle: JoinHandle<PDFResult<Arc<OperatorList>>>,
}

impl PageTask {
    pub fn page_index(&self) -> usize {
        self.index
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the operator list. A cancelled task yields `Cancelled`.
    pub async fn wait(self) -> PDFResult<Arc<OperatorList>> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(PDFError::Cancelled(format!(
                "compilation of page {} was cancelled",
                self.index
            ))),
            Err(err) => Err(PDFError::Generic(format!(
                "compilation of page {} panicked: {}",
                self.index, err
            ))),
        }
    }
}

impl PDFDocument {
    /// Opens a PDF document held in memory.
    ///
    /// # Example
    /// ```no_run
    /// use pdf_resolve::core::{LoadOptions, PDFDocument};
    ///
    /// # async fn example() -> pdf_resolve::core::PDFResult<()> {
    /// let pdf_data = std::fs::read("document.pdf").unwrap();
    /// let doc = PDFDocument::open(pdf_data, LoadOptions::default()).await?;
    /// println!("{} pages", doc.page_count());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn open(data: impl Into<Bytes>, options: LoadOptions) -> PDFResult<Self> {
        Self::open_source(Arc::new(MemorySource::new(data)), options).await
    }

    /// Opens a local file, reading chunks on demand.
    pub async fn open_file(path: impl AsRef<Path>, options: LoadOptions) -> PDFResult<Self> {
        let source = FileSource::open(path).await?;
        Self::open_source(Arc::new(source), options).await
    }

    /// Opens a remote file with HTTP range requests.
    #[cfg(feature = "network")]
    pub async fn open_url(url: impl Into<String>, options: LoadOptions) -> PDFResult<Self> {
        let source = super::http_source::HttpSource::new(url, &options)?;
        Self::open_source(Arc::new(source), options).await
    }

    /// Opens a document from any byte source.
    pub async fn open_source(source: Arc<dyn ByteSource>, options: LoadOptions) -> PDFResult<Self> {
        Self::open_with_registry(source, options, FilterRegistry::with_builtins()).await
    }

    /// Like [`open_source`](Self::open_source) with a custom filter registry.
    pub async fn open_with_registry(
        source: Arc<dyn ByteSource>,
        options: LoadOptions,
        registry: FilterRegistry,
    ) -> PDFResult<Self> {
        let diagnostics = Diagnostics::new();
        let manager = ChunkedStreamManager::open(source, &options, diagnostics.clone()).await?;
        let store = ObjectStore::open(manager, registry, &options, diagnostics.clone()).await?;

        let root = store.root()?;
        let catalog = match &*store.fetch(root).await? {
            PDFObject::Dictionary(dict) => dict.clone(),
            other => {
                return Err(PDFError::InvalidDocument(format!(
                    "catalog {} is a {}",
                    root,
                    other.kind()
                )));
            }
        };
        let pages = PageTree::load(Arc::clone(&store), &catalog).await?;
        info!("Document has {} pages", pages.count());

        let capacity = NonZeroUsize::new(options.page_cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(PDFDocument {
            inner: Arc::new(DocumentInner {
                resolver: ResourceResolver::new(Arc::clone(&store)),
                store,
                catalog,
                pages,
                options,
                diagnostics,
                lists: Mutex::new(LruCache::new(capacity)),
                compiles: PendingTable::new("page"),
            }),
        })
    }

    /// Returns the document catalog (root dictionary).
    pub fn catalog(&self) -> &Dict {
        &self.inner.catalog
    }

    /// Gets the number of pages in the document.
    pub fn page_count(&self) -> usize {
        self.inner.pages.count()
    }

    /// Gets page `index` (0-based).
    pub async fn get_page(&self, index: usize) -> PDFResult<Page> {
        self.inner.pages.get_page(index).await
    }

    /// The `/Info` dictionary with its values resolved.
    pub async fn info(&self) -> PDFResult<Option<Dict>> {
        let trailer = self.inner.store.trailer()?;
        let Some(info) = trailer.get("Info") else {
            return Ok(None);
        };
        let info = self.inner.store.resolve_deep(info.clone(), 2).await?;
        Ok(info.as_dict().cloned())
    }

    /// Compiles page `index` into an operator list.
    ///
    /// Lists are cached; concurrent requests for one page share a single
    /// compilation.
    pub async fn operator_list(&self, index: usize) -> PDFResult<Arc<OperatorList>> {
        if let Some(list) = self.inner.lock_lists().get(&index) {
            return Ok(Arc::clone(list));
        }
        let inner = Arc::clone(&self.inner);
        let awaiter = self.inner.compiles.get_or_spawn(
            index,
            || self.inner.lock_lists().peek(&index).cloned(),
            move || compile_page(inner, index),
        );
        awaiter.wait().await
    }

    /// Starts compiling page `index` in the background.
    pub fn compile_page(&self, index: usize) -> PageTask {
        let document = self.clone();
        PageTask {
            index,
            handle: tokio::spawn(async move { document.operator_list(index).await }),
        }
    }

    /// Fetches an object from the newest revision.
    pub async fn fetch(&self, reference: Ref) -> PDFResult<Arc<PDFObject>> {
        self.inner.store.fetch(reference).await
    }

    /// Fetches an object as of `revision` (0 is the original file).
    pub async fn fetch_at_revision(&self, reference: Ref, revision: usize) -> PDFResult<PDFObject> {
        self.inner.store.fetch_at_revision(reference, revision).await
    }

    /// Decoded bytes of the stream object `reference`.
    pub async fn get_stream_bytes(&self, reference: Ref) -> PDFResult<Bytes> {
        self.inner.store.get_stream_bytes(reference).await
    }

    pub fn revision_count(&self) -> usize {
        self.inner.store.revision_count()
    }

    pub fn is_encrypted(&self) -> bool {
        self.inner.store.is_encrypted()
    }

    pub fn permissions(&self) -> Option<Permissions> {
        self.inner.store.permissions()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.inner.diagnostics
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.store.stats()
    }

    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.inner.store
    }

    /// Number of pages with a cached operator list.
    pub fn cached_pages(&self) -> usize {
        self.inner.lock_lists().len()
    }

    /// Cancels all loading: in-flight fetches, resource loads and page
    /// compilations fail with `Cancelled`, and so does anything started
    /// afterwards that needs more data.
    pub fn cancel(&self, reason: &str) {
        info!("Cancelling document: {}", reason);
        self.inner.store.cancel(reason);
        self.inner.resolver.cancel(reason);
        self.inner
            .compiles
            .cancel_all(PDFError::Cancelled(reason.to_string()));
    }
}

impl DocumentInner {
    fn lock_lists(&self) -> std::sync::MutexGuard<'_, LruCache<usize, Arc<OperatorList>>> {
        self.lists.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loads a page's content streams and resources and runs the interpreter.
async fn compile_page(inner: Arc<DocumentInner>, index: usize) -> PDFResult<Arc<OperatorList>> {
    let page = inner.pages.get_page(index).await?;
    let store = &inner.store;

    let mut content = BytesMut::new();
    for entry in page.contents() {
        let bytes = match entry {
            PDFObject::Ref(r) => store.get_stream_bytes(*r).await?,
            PDFObject::Stream(stream) => store.decode_stream_object(stream, None).await?.bytes,
            other => {
                inner.diagnostics.warn(
                    WarningKind::MalformedObject,
                    format!("page {} has a {} in /Contents", index, other.kind()),
                );
                continue;
            }
        };
        content.extend_from_slice(&bytes);
        content.extend_from_slice(b"\n");
    }

    let frame = ScopeFrame::load(store, page.resources()).await?;
    debug!("Compiling page {} ({} content bytes)", index, content.len());
    let list = ContentInterpreter::new(
        content.freeze(),
        ResourceScope::new(frame),
        Arc::clone(&inner.resolver),
        inner.options.max_form_depth,
        inner.diagnostics.clone(),
    )
    .with_label(format!("page {}", index))
    .run()
    .await?;

    inner.lock_lists().put(index, Arc::clone(&list));
    Ok(list)
}
