//! Indirect object resolution over a partially loaded file.
//!
//! [`ObjectStore`] owns the cross-reference data, the decoded security
//! handler and every cache of one document. All lookups go through
//! [`ObjectStore::fetch`]: a cached object is returned at once, an object
//! already being resolved is joined, anything else is resolved on a spawned
//! task that loads the bytes it needs and parses the object.
//!
//! Parsing is synchronous and raises `DataMissing` for bytes that have not
//! arrived; the async code here loads them and parses again.

use super::base_stream::BaseStream;
use super::chunked_stream::ChunkedStreamManager;
use super::config::LoadOptions;
use super::diagnostics::{Diagnostics, WarningKind};
use super::encryption::{CipherTransform, CipherTransformFactory, Permissions};
use super::error::{ErrorLevel, PDFError, PDFResult};
use super::filter::{DecodedStream, FilterChain, FilterRegistry};
use super::lexer::Lexer;
use super::parser::Parser;
use super::pending::{BoxFuture, PendingTable};
use super::primitives::{Dict, PDFObject, Ref, StreamObject};
use super::stream::Stream;
use super::xref::{
    XRef, XRefEntry, XRefLoader, find_startxref, read_object_stream_header, scan_object_headers,
};
use crate::retry_on_data_missing_with_limit;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

/// Indirect `/Length` values followed while parsing one object.
const MAX_DEPENDENCIES: usize = 32;

/// Repair window around a broken offset.
const REPAIR_BEFORE: usize = 1024;
const REPAIR_AFTER: usize = 64 * 1024;

/// Counters exposed for inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Objects parsed from the file (object stream members excluded).
    pub object_parses: usize,
    /// Fetches and decodes answered from the caches.
    pub cache_hits: usize,
    pub range_requests: usize,
    pub sequential_reads: usize,
    pub bytes_loaded: usize,
}

struct Security {
    factory: CipherTransformFactory,
    /// The `/Encrypt` dictionary when it is an indirect object; never decrypted.
    encrypt_ref: Option<Ref>,
}

/// Members of one object stream, in header order.
type ObjectStreamContents = Arc<Vec<(u32, PDFObject)>>;

/// Per-document object cache and resolver.
pub struct ObjectStore {
    manager: Arc<ChunkedStreamManager>,
    registry: FilterRegistry,
    diagnostics: Diagnostics,
    max_retries: usize,

    xref: Mutex<Option<Arc<XRef>>>,
    security: OnceLock<Security>,

    objects: Mutex<FxHashMap<Ref, Arc<PDFObject>>>,
    decoded: Mutex<FxHashMap<Ref, DecodedStream>>,

    fetches: PendingTable<Ref, Arc<PDFObject>>,
    decodes: PendingTable<Ref, DecodedStream>,
    object_streams: PendingTable<u32, ObjectStreamContents>,
    /// `(object, /Length object)` pairs currently waiting on each other.
    dependency_waits: Mutex<Vec<(Ref, Ref)>>,

    parses: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("length", &self.manager.length())
            .field("cached", &self.lock_objects().len())
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl ObjectStore {
    /// Loads the cross-reference data, unlocks encryption and checks that
    /// the catalog can be read.
    ///
    /// A broken or missing cross-reference chain is rebuilt by scanning the
    /// whole file. Fails with `InvalidDocument` when no catalog can be found
    /// and with `PasswordRequired`/`PasswordIncorrect` for encrypted files.
    pub async fn open(
        manager: Arc<ChunkedStreamManager>,
        registry: FilterRegistry,
        options: &LoadOptions,
        diagnostics: Diagnostics,
    ) -> PDFResult<Arc<Self>> {
        if manager.length() == 0 {
            return Err(PDFError::InvalidDocument("The file is empty".to_string()));
        }

        let store = Arc::new(ObjectStore {
            manager,
            registry,
            diagnostics,
            max_retries: options.max_retries,
            xref: Mutex::new(None),
            security: OnceLock::new(),
            objects: Mutex::new(FxHashMap::default()),
            decoded: Mutex::new(FxHashMap::default()),
            fetches: PendingTable::new("object"),
            decodes: PendingTable::new("decode"),
            object_streams: PendingTable::new("object stream"),
            dependency_waits: Mutex::new(Vec::new()),
            parses: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        });

        let xref = store.load_xref().await?;
        store.set_xref(xref);
        store.setup_security(options.password.as_deref()).await?;
        store.check_catalog().await?;

        let xref = store.xref()?;
        info!(
            "Opened document: {} revisions, {} objects{}",
            xref.revision_count(),
            xref.object_numbers().len(),
            if xref.is_repaired() { " (repaired)" } else { "" }
        );
        Ok(store)
    }

    async fn load_xref(self: &Arc<Self>) -> PDFResult<XRef> {
        let stream = self.manager.stream();
        let startxref =
            retry_on_data_missing_with_limit!(self.manager, self.max_retries, find_startxref(&stream))?;

        match startxref {
            Some(offset) => {
                let mut loader = XRefLoader::new(offset);
                let mut chain = Ok(());
                while !loader.is_done() {
                    chain = retry_on_data_missing_with_limit!(
                        self.manager,
                        self.max_retries,
                        loader.parse_next(&stream, &self.registry, &self.diagnostics)
                    );
                    if chain.is_err() {
                        break;
                    }
                }
                match chain.and_then(|_| loader.finish()) {
                    Ok(xref) => return Ok(xref),
                    Err(e) if e.level() == ErrorLevel::Transport => return Err(e),
                    Err(e) => warn!(
                        "Cross-reference chain from {} is unusable ({}), reconstructing",
                        offset, e
                    ),
                }
            }
            None => warn!("No startxref in the last bytes of the file, reconstructing"),
        }
        self.reconstruct_xref().await
    }

    async fn reconstruct_xref(self: &Arc<Self>) -> PDFResult<XRef> {
        let data = self.manager.get_range(0, self.manager.length()).await?;
        XRef::reconstruct(&data, &self.registry, &self.diagnostics)
    }

    fn set_xref(&self, xref: XRef) {
        *self.xref.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(xref));
        self.lock_objects().clear();
        self.lock_decoded().clear();
    }

    async fn setup_security(self: &Arc<Self>, password: Option<&[u8]>) -> PDFResult<()> {
        let xref = self.xref()?;
        let Some(encrypt) = xref.trailer().get("Encrypt").cloned() else {
            return Ok(());
        };

        let (dict, encrypt_ref) = match encrypt {
            PDFObject::Ref(r) => (self.fetch(r).await?.as_dict().cloned(), Some(r)),
            PDFObject::Dictionary(dict) => (Some(dict), None),
            _ => (None, None),
        };
        let dict = dict.ok_or_else(|| {
            PDFError::InvalidDocument("/Encrypt is not a dictionary".to_string())
        })?;

        let factory = CipherTransformFactory::new(&dict, &xref.file_id(), password)?;
        debug!(
            "Security handler unlocked (V{} R{}, owner: {})",
            factory.encrypt_dict().version,
            factory.encrypt_dict().revision,
            factory.owner_authenticated()
        );

        // Everything read so far was parsed without decryption.
        self.lock_objects().retain(|r, _| Some(*r) == encrypt_ref);
        self.lock_decoded().clear();
        let _ = self.security.set(Security {
            factory,
            encrypt_ref,
        });
        Ok(())
    }

    async fn check_catalog(self: &Arc<Self>) -> PDFResult<()> {
        if self.catalog_is_usable().await? {
            return Ok(());
        }
        if self.xref()?.is_repaired() {
            return Err(PDFError::InvalidDocument("No usable catalog".to_string()));
        }

        warn!("Catalog cannot be read through the cross-reference table, reconstructing");
        let rebuilt = self.reconstruct_xref().await?;
        self.set_xref(rebuilt);
        if self.catalog_is_usable().await? {
            Ok(())
        } else {
            Err(PDFError::InvalidDocument("No usable catalog".to_string()))
        }
    }

    async fn catalog_is_usable(self: &Arc<Self>) -> PDFResult<bool> {
        let Some(root) = self.xref()?.root() else {
            return Ok(false);
        };
        Ok(self.fetch(root).await?.as_dict().is_some())
    }

    // ------------------------------------------------------------------
    // Object fetching
    // ------------------------------------------------------------------

    /// Resolves `reference`, joining a resolution already in flight.
    ///
    /// Free, absent and unreadable objects resolve to `Null` with a warning;
    /// only transport failures and cancellation are returned as errors.
    pub fn fetch(self: &Arc<Self>, reference: Ref) -> BoxFuture<'static, PDFResult<Arc<PDFObject>>> {
        let store = Arc::clone(self);
        Box::pin(async move {
            if let Some(object) = store.cached(reference) {
                store.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(object);
            }
            store.manager.check_cancelled()?;
            let producer = Arc::clone(&store);
            let awaiter = store.fetches.get_or_spawn(
                reference,
                || store.cached(reference),
                move || producer.resolve(reference),
            );
            awaiter.wait().await
        })
    }

    /// Resolves `object` if it is a reference, otherwise returns it.
    pub async fn fetch_if_ref(self: &Arc<Self>, object: &PDFObject) -> PDFResult<PDFObject> {
        match object {
            PDFObject::Ref(r) => Ok((*self.fetch(*r).await?).clone()),
            other => Ok(other.clone()),
        }
    }

    /// The object as of `revision` (0 = the original file), bypassing the
    /// cache.
    pub async fn fetch_at_revision(
        self: &Arc<Self>,
        reference: Ref,
        revision: usize,
    ) -> PDFResult<PDFObject> {
        let entry = self.xref()?.entry_at_revision(reference.num, revision);
        self.resolve_entry(reference, entry).await
    }

    /// Cached value of `reference`, if resolved.
    pub fn cached(&self, reference: Ref) -> Option<Arc<PDFObject>> {
        self.lock_objects().get(&reference).cloned()
    }

    async fn resolve(self: Arc<Self>, reference: Ref) -> PDFResult<Arc<PDFObject>> {
        let entry = self.xref()?.get_entry(reference.num);
        let object = self.resolve_entry(reference, entry).await?;
        Ok(self.cache_object(reference, object))
    }

    /// First write wins; later ones get the cached value back.
    fn cache_object(&self, reference: Ref, object: PDFObject) -> Arc<PDFObject> {
        self.lock_objects()
            .entry(reference)
            .or_insert_with(|| Arc::new(object))
            .clone()
    }

    async fn resolve_entry(
        self: &Arc<Self>,
        reference: Ref,
        entry: Option<XRefEntry>,
    ) -> PDFResult<PDFObject> {
        match entry {
            Some(XRefEntry::Uncompressed { offset, generation }) => {
                if generation != reference.generation {
                    return Ok(self.missing(
                        reference,
                        format_args!("the table has generation {}", generation),
                    ));
                }
                if offset >= self.manager.length() {
                    return Ok(self.missing(
                        reference,
                        format_args!("offset {} is past the end of the file", offset),
                    ));
                }
                self.parse_uncompressed(reference, offset).await
            }
            Some(XRefEntry::Compressed {
                obj_stream_num,
                index,
            }) => {
                if reference.generation != 0 {
                    return Ok(self.missing(reference, "compressed objects have generation 0"));
                }
                self.parse_compressed(reference, obj_stream_num, index).await
            }
            Some(XRefEntry::Free { .. }) => Ok(self.missing(reference, "the entry is free")),
            None => Ok(self.missing(reference, "not in the cross-reference table")),
        }
    }

    fn missing(&self, reference: Ref, reason: impl fmt::Display) -> PDFObject {
        self.diagnostics.warn(
            WarningKind::MissingObject,
            format!("object {} resolved to null: {}", reference, reason),
        );
        PDFObject::Null
    }

    async fn parse_uncompressed(self: &Arc<Self>, reference: Ref, offset: usize) -> PDFResult<PDFObject> {
        match self.parse_with_dependencies(reference, offset).await {
            Ok(object) => Ok(object),
            Err(e) if is_repairable(&e) => self.repair(reference, offset, e).await,
            Err(e) => Err(e),
        }
    }

    /// Parses at `offset`, loading indirect `/Length` objects as they are
    /// asked for.
    async fn parse_with_dependencies(
        self: &Arc<Self>,
        reference: Ref,
        offset: usize,
    ) -> PDFResult<PDFObject> {
        let mut followed = 0;
        loop {
            let attempt = retry_on_data_missing_with_limit!(
                self.manager,
                self.max_retries,
                self.parse_at(reference, offset, true)
            );
            match attempt {
                Err(PDFError::ObjectPending(dependency))
                    if dependency != reference && followed < MAX_DEPENDENCIES =>
                {
                    followed += 1;
                    trace!("Object {} waits for {}", reference, dependency);
                    self.load_dependency(reference, dependency).await?;
                }
                Err(PDFError::ObjectPending(dependency)) => {
                    return Err(PDFError::MalformedObject(format!(
                        "object {} keeps asking for {}",
                        reference, dependency
                    )));
                }
                other => return other,
            }
        }
    }

    /// Loads the `/Length` object `dependency` that `reference` is waiting
    /// for, joining a fetch of it already in flight.
    ///
    /// A fresh load parses the dependency without following references
    /// inside it. When the dependency is itself (transitively) waiting on
    /// `reference`, joining would never finish, so it is parsed on the side.
    async fn load_dependency(self: &Arc<Self>, reference: Ref, dependency: Ref) -> PDFResult<()> {
        let Some(_edge) = DependencyEdge::enter(&self.dependency_waits, reference, dependency) else {
            debug!("Objects {} and {} wait on each other", reference, dependency);
            if let Some(object) = self.parse_length_object(dependency).await? {
                self.cache_object(dependency, object);
            }
            return Ok(());
        };

        let producer = Arc::clone(self);
        self.fetches
            .get_or_spawn(
                dependency,
                || self.cached(dependency),
                move || producer.resolve_length_object(dependency),
            )
            .wait()
            .await
            .map(|_| ())
    }

    // Boxed: resolution recurses through `load_dependency`.
    fn resolve_length_object(self: Arc<Self>, reference: Ref) -> BoxFuture<'static, PDFResult<Arc<PDFObject>>> {
        Box::pin(async move {
            if let Some(object) = self.parse_length_object(reference).await? {
                return Ok(self.cache_object(reference, object));
            }
            let entry = self.xref()?.get_entry(reference.num);
            let object = self.resolve_entry(reference, entry).await?;
            Ok(self.cache_object(reference, object))
        })
    }

    /// Parses an uncompressed object at its recorded offset without
    /// following references. `None` when that does not work and the full
    /// resolution path has to take over.
    async fn parse_length_object(self: &Arc<Self>, reference: Ref) -> PDFResult<Option<PDFObject>> {
        let entry = self.xref()?.get_entry(reference.num);
        let Some(XRefEntry::Uncompressed { offset, generation }) = entry else {
            return Ok(None);
        };
        if generation != reference.generation || offset >= self.manager.length() {
            return Ok(None);
        }
        let parsed = retry_on_data_missing_with_limit!(
            self.manager,
            self.max_retries,
            self.parse_at(reference, offset, false)
        );
        match parsed {
            Ok(object) => Ok(Some(object)),
            Err(e) if !is_repairable(&e) => Err(e),
            Err(_) => Ok(None),
        }
    }

    fn parse_at(self: &Arc<Self>, reference: Ref, offset: usize, follow: bool) -> PDFResult<PDFObject> {
        let stream = self.manager.stream();
        let sub = stream.make_sub_stream(offset, self.manager.length() - offset)?;
        let mut parser = Parser::new(Lexer::new(sub)?)?;

        let store = Arc::clone(self);
        parser.set_ref_resolver(move |dependency| match store.cached(dependency) {
            Some(object) => Ok((*object).clone()),
            None if follow => Err(PDFError::ObjectPending(dependency)),
            None => Ok(PDFObject::Null),
        });
        parser.set_cipher(self.cipher_for(reference));

        let (_, object) = parser.parse_indirect_object(Some(reference))?;
        self.parses.fetch_add(1, Ordering::Relaxed);
        Ok(object)
    }

    /// Looks for the object's own header near a broken offset.
    async fn repair(self: &Arc<Self>, reference: Ref, offset: usize, cause: PDFError) -> PDFResult<PDFObject> {
        let begin = offset.saturating_sub(REPAIR_BEFORE);
        let end = offset.saturating_add(REPAIR_AFTER).min(self.manager.length());
        let window = self.manager.get_range(begin, end).await?;

        let candidate = scan_object_headers(&window)
            .into_iter()
            // a header cut by the window start may have lost digits
            .filter(|(found, start, _)| found.num == reference.num && (*start > 0 || begin == 0))
            .map(|(_, start, _)| begin + start)
            .filter(|&at| at != offset)
            .min_by_key(|&at| at.abs_diff(offset));

        if let Some(at) = candidate {
            match self.parse_with_dependencies(reference, at).await {
                Ok(object) => {
                    self.diagnostics.warn(
                        WarningKind::MalformedObject,
                        format!(
                            "object {} repaired: found at {} instead of {}",
                            reference, at, offset
                        ),
                    );
                    return Ok(object);
                }
                Err(e) if !is_repairable(&e) => return Err(e),
                Err(_) => {}
            }
        }

        self.diagnostics.warn(
            WarningKind::MalformedObject,
            format!(
                "object {} at {} is unreadable: {}",
                reference,
                offset,
                cause.message()
            ),
        );
        Ok(PDFObject::Null)
    }

    async fn parse_compressed(
        self: &Arc<Self>,
        reference: Ref,
        stream_num: u32,
        index: u32,
    ) -> PDFResult<PDFObject> {
        let contents = self.object_stream(stream_num).await?;
        let found = match contents.get(index as usize) {
            Some((num, object)) if *num == reference.num => Some(object.clone()),
            _ => contents
                .iter()
                .find(|(num, _)| *num == reference.num)
                .map(|(_, object)| object.clone()),
        };
        Ok(found.unwrap_or_else(|| {
            self.missing(reference, format_args!("not in object stream {}", stream_num))
        }))
    }

    async fn object_stream(self: &Arc<Self>, stream_num: u32) -> PDFResult<ObjectStreamContents> {
        let producer = Arc::clone(self);
        self.object_streams
            .get_or_spawn(stream_num, || None, move || producer.load_object_stream(stream_num))
            .wait()
            .await
    }

    /// Parses every member of an object stream and caches the ones the
    /// cross-reference data still points at.
    async fn load_object_stream(self: Arc<Self>, stream_num: u32) -> PDFResult<ObjectStreamContents> {
        let container = Ref::new(stream_num, 0);
        let object = self.fetch(container).await?;
        let Some(stream) = object.as_stream() else {
            self.diagnostics.warn(
                WarningKind::MalformedObject,
                format!("object stream {} is {}", container, object.kind()),
            );
            return Ok(Arc::new(Vec::new()));
        };
        let n = stream.get("N").and_then(PDFObject::as_usize).unwrap_or(0);
        let first = stream.get("First").and_then(PDFObject::as_usize).unwrap_or(0);

        let data = self.decode_stream(container).await?.bytes;
        let contents = match parse_object_stream(&data, n, first) {
            Ok(contents) => contents,
            Err(e) => {
                self.diagnostics.warn(
                    WarningKind::MalformedObject,
                    format!("object stream {}: {}", container, e.message()),
                );
                Vec::new()
            }
        };

        let xref = self.xref()?;
        for (index, (num, object)) in contents.iter().enumerate() {
            let expected = XRefEntry::Compressed {
                obj_stream_num: stream_num,
                index: index as u32,
            };
            if xref.get_entry(*num) == Some(expected) {
                self.cache_object(Ref::new(*num, 0), object.clone());
            }
        }
        debug!("Object stream {} holds {} objects", stream_num, contents.len());
        Ok(Arc::new(contents))
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Decoded data of the stream object `reference`, decoded once.
    pub fn decode_stream(self: &Arc<Self>, reference: Ref) -> BoxFuture<'static, PDFResult<DecodedStream>> {
        let store = Arc::clone(self);
        Box::pin(async move {
            if let Some(decoded) = store.cached_decoded(reference) {
                store.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(decoded);
            }
            let producer = Arc::clone(&store);
            let awaiter = store.decodes.get_or_spawn(
                reference,
                || store.cached_decoded(reference),
                move || producer.decode_uncached(reference),
            );
            awaiter.wait().await
        })
    }

    /// Decoded bytes of the stream object `reference`. Anything that is not
    /// a stream yields empty bytes and a warning.
    pub async fn get_stream_bytes(self: &Arc<Self>, reference: Ref) -> PDFResult<Bytes> {
        Ok(self.decode_stream(reference).await?.bytes)
    }

    fn cached_decoded(&self, reference: Ref) -> Option<DecodedStream> {
        self.lock_decoded().get(&reference).cloned()
    }

    async fn decode_uncached(self: Arc<Self>, reference: Ref) -> PDFResult<DecodedStream> {
        let object = self.fetch(reference).await?;
        let decoded = match object.as_stream() {
            Some(stream) => self.decode_stream_object(stream, Some(reference)).await?,
            None => {
                self.diagnostics.warn(
                    WarningKind::MalformedObject,
                    format!("object {} is {}, not a stream", reference, object.kind()),
                );
                DecodedStream::empty()
            }
        };
        Ok(self
            .lock_decoded()
            .entry(reference)
            .or_insert(decoded)
            .clone())
    }

    /// Runs the filter chain of `stream`, resolving indirect `/Filter` and
    /// `/DecodeParms` first. `owner` selects the decryption key; direct
    /// streams (inline images) pass `None`.
    pub async fn decode_stream_object(
        self: &Arc<Self>,
        stream: &StreamObject,
        owner: Option<Ref>,
    ) -> PDFResult<DecodedStream> {
        let mut dict = stream.dict.clone();
        for key in ["Filter", "DecodeParms"] {
            let Some(value) = dict.get(key).cloned() else {
                continue;
            };
            if contains_ref(&value) {
                let resolved = self.resolve_deep(value, 4).await?;
                dict.insert(key.to_string(), resolved);
            }
        }

        let cipher = owner.and_then(|r| self.stream_cipher(r, &dict));
        Ok(FilterChain::from_dict(&dict).decode(
            &stream.raw,
            &self.registry,
            cipher.as_ref(),
            &self.diagnostics,
        ))
    }

    fn cipher_for(&self, reference: Ref) -> Option<CipherTransform> {
        let security = self.security.get()?;
        if security.encrypt_ref == Some(reference) {
            return None;
        }
        let cipher = security
            .factory
            .create_cipher_transform(reference.num, reference.generation);
        (!cipher.is_identity()).then_some(cipher)
    }

    fn stream_cipher(&self, reference: Ref, dict: &Dict) -> Option<CipherTransform> {
        let security = self.security.get()?;
        let kind = dict.get("Type");
        if kind.is_some_and(|t| t.is_name("XRef")) {
            return None;
        }
        if kind.is_some_and(|t| t.is_name("Metadata")) && !security.factory.encrypt_metadata() {
            return None;
        }
        // A stream-level Crypt filter naming Identity (or nothing) opts out.
        let chain = FilterChain::from_dict(dict);
        if let Some(position) = chain.names().position(|name| name == "Crypt") {
            let name = match dict.get("DecodeParms") {
                Some(PDFObject::Array(params)) => params.get(position).and_then(|p| p.get("Name")),
                Some(params) => params.get("Name"),
                None => None,
            };
            if name.is_none_or(|n| n.is_name("Identity")) {
                return None;
            }
        }
        self.cipher_for(reference)
    }

    // ------------------------------------------------------------------
    // Deep resolution
    // ------------------------------------------------------------------

    /// Replaces references inside `object` by their values, following at
    /// most `depth` references along any path. References that would
    /// close a cycle, or lie deeper, stay references.
    pub fn resolve_deep(self: &Arc<Self>, object: PDFObject, depth: usize) -> BoxFuture<'static, PDFResult<PDFObject>> {
        let store = Arc::clone(self);
        Box::pin(async move {
            let mut path = Vec::new();
            store.resolve_within(object, depth, &mut path).await
        })
    }

    fn resolve_within<'a>(
        self: &'a Arc<Self>,
        object: PDFObject,
        depth: usize,
        path: &'a mut Vec<Ref>,
    ) -> BoxFuture<'a, PDFResult<PDFObject>> {
        Box::pin(async move {
            match object {
                PDFObject::Ref(r) => {
                    if depth == 0 || path.contains(&r) {
                        return Ok(PDFObject::Ref(r));
                    }
                    let value = (*self.fetch(r).await?).clone();
                    path.push(r);
                    let resolved = self.resolve_within(value, depth - 1, path).await;
                    path.pop();
                    resolved
                }
                PDFObject::Array(items) => {
                    let mut resolved = Vec::with_capacity(items.len());
                    for item in items {
                        resolved.push(self.resolve_within(item, depth, path).await?);
                    }
                    Ok(PDFObject::Array(resolved))
                }
                PDFObject::Dictionary(dict) => Ok(PDFObject::Dictionary(
                    self.resolve_dict(dict, depth, path).await?,
                )),
                PDFObject::Stream(mut stream) => {
                    let dict = std::mem::take(&mut stream.dict);
                    stream.dict = self.resolve_dict(dict, depth, path).await?;
                    Ok(PDFObject::Stream(stream))
                }
                other => Ok(other),
            }
        })
    }

    async fn resolve_dict(
        self: &Arc<Self>,
        dict: Dict,
        depth: usize,
        path: &mut Vec<Ref>,
    ) -> PDFResult<Dict> {
        let mut resolved = Dict::with_capacity(dict.len());
        for (key, value) in dict {
            let value = self.resolve_within(value, depth, path).await?;
            resolved.insert(key, value);
        }
        Ok(resolved)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn xref(&self) -> PDFResult<Arc<XRef>> {
        self.xref
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PDFError::Generic("Cross-reference data not loaded".to_string()))
    }

    /// Merged trailer dictionary.
    pub fn trailer(&self) -> PDFResult<Dict> {
        Ok(self.xref()?.trailer().clone())
    }

    /// Reference of the document catalog.
    pub fn root(&self) -> PDFResult<Ref> {
        self.xref()?
            .root()
            .ok_or_else(|| PDFError::InvalidDocument("Trailer has no /Root".to_string()))
    }

    pub fn revision_count(&self) -> usize {
        self.xref().map(|x| x.revision_count()).unwrap_or(0)
    }

    pub fn is_encrypted(&self) -> bool {
        self.security.get().is_some()
    }

    pub fn permissions(&self) -> Option<Permissions> {
        self.security
            .get()
            .map(|s| s.factory.encrypt_dict().permissions())
    }

    pub fn manager(&self) -> &Arc<ChunkedStreamManager> {
        &self.manager
    }

    pub fn registry(&self) -> &FilterRegistry {
        &self.registry
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            object_parses: self.parses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            range_requests: self.manager.range_requests(),
            sequential_reads: self.manager.sequential_reads(),
            bytes_loaded: self.manager.bytes_loaded(),
        }
    }

    /// Aborts loading and rejects every fetch and decode in flight.
    pub fn cancel(&self, reason: &str) {
        self.manager.cancel(reason);
        let err = PDFError::Cancelled(reason.to_string());
        self.fetches.cancel_all(err.clone());
        self.decodes.cancel_all(err.clone());
        self.object_streams.cancel_all(err);
    }

    fn lock_objects(&self) -> MutexGuard<'_, FxHashMap<Ref, Arc<PDFObject>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_decoded(&self) -> MutexGuard<'_, FxHashMap<Ref, DecodedStream>> {
        self.decoded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Errors that mean "the bytes at this offset are not the object".
fn is_repairable(err: &PDFError) -> bool {
    matches!(err.level(), ErrorLevel::Object | ErrorLevel::Content)
        || matches!(
            err,
            PDFError::UnexpectedEndOfStream
                | PDFError::InvalidByteRange { .. }
                | PDFError::InvalidPosition { .. }
        )
}

fn contains_ref(object: &PDFObject) -> bool {
    match object {
        PDFObject::Ref(_) => true,
        PDFObject::Array(items) => items.iter().any(contains_ref),
        PDFObject::Dictionary(dict) => dict.values().any(contains_ref),
        _ => false,
    }
}

/// Splits decoded object stream data into its members. A member that does
/// not parse becomes `Null`.
fn parse_object_stream(data: &Bytes, n: usize, first: usize) -> PDFResult<Vec<(u32, PDFObject)>> {
    if first > data.len() {
        return Err(PDFError::MalformedObject(format!(
            "/First {} is past the {} decoded bytes",
            first,
            data.len()
        )));
    }
    let header = read_object_stream_header(&data[..first], n)?;

    let mut objects = Vec::with_capacity(header.len());
    for (num, relative) in header {
        let object = match first.checked_add(relative) {
            Some(start) if start < data.len() => parse_member(data, start).unwrap_or(PDFObject::Null),
            _ => PDFObject::Null,
        };
        objects.push((num, object));
    }
    Ok(objects)
}

fn parse_member(data: &Bytes, start: usize) -> PDFResult<PDFObject> {
    let stream = Stream::new(data.clone(), start, data.len() - start);
    let mut parser = Parser::new(Lexer::new(Box::new(stream))?)?;
    parser.get_object()
}

/// One registered wait of an object on its `/Length` object; removed on
/// drop.
struct DependencyEdge<'a> {
    waits: &'a Mutex<Vec<(Ref, Ref)>>,
    edge: (Ref, Ref),
}

impl<'a> DependencyEdge<'a> {
    /// Registers `from -> to` unless `to` already (transitively) waits on
    /// `from`.
    fn enter(waits: &'a Mutex<Vec<(Ref, Ref)>>, from: Ref, to: Ref) -> Option<Self> {
        let mut edges = waits.lock().unwrap_or_else(PoisonError::into_inner);
        if to == from || reaches(&edges, to, from) {
            return None;
        }
        edges.push((from, to));
        Some(DependencyEdge {
            waits,
            edge: (from, to),
        })
    }
}

impl Drop for DependencyEdge<'_> {
    fn drop(&mut self) {
        let mut edges = self.waits.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(at) = edges.iter().position(|edge| *edge == self.edge) {
            edges.swap_remove(at);
        }
    }
}

fn reaches(edges: &[(Ref, Ref)], from: Ref, target: Ref) -> bool {
    let mut seen = vec![from];
    let mut next = vec![from];
    while let Some(at) = next.pop() {
        for &(_, to) in edges.iter().filter(|(f, _)| *f == at) {
            if to == target {
                return true;
            }
            if !seen.contains(&to) {
                seen.push(to);
                next.push(to);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::byte_source::MemorySource;

    /// Classic single-section file from `(num, body)` pairs.
    fn build_pdf(objects: &[(u32, &[u8])], trailer: &str) -> Vec<u8> {
        let mut out = b"%PDF-1.7\n".to_vec();
        let mut offsets = Vec::new();
        for (num, body) in objects {
            offsets.push((*num, out.len()));
            out.extend_from_slice(format!("{} 0 obj\n", num).as_bytes());
            out.extend_from_slice(body);
            out.extend_from_slice(b"\nendobj\n");
        }
        let size = objects.iter().map(|(n, _)| n + 1).max().unwrap_or(1);
        let xref = out.len();
        out.extend_from_slice(format!("xref\n0 {}\n0000000000 65535 f \n", size).as_bytes());
        for num in 1..size {
            match offsets.iter().find(|(n, _)| *n == num) {
                Some((_, offset)) => {
                    out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes())
                }
                None => out.extend_from_slice(b"0000000000 65535 f \n"),
            }
        }
        out.extend_from_slice(
            format!(
                "trailer\n<< /Size {} {} >>\nstartxref\n{}\n%%EOF\n",
                size, trailer, xref
            )
            .as_bytes(),
        );
        out
    }

    fn catalog() -> (u32, &'static [u8]) {
        (1, b"<< /Type /Catalog /Pages 2 0 R >>")
    }

    async fn open(data: Vec<u8>) -> PDFResult<Arc<ObjectStore>> {
        let options = LoadOptions::default().with_chunk_size(64);
        let diagnostics = Diagnostics::new();
        let manager =
            ChunkedStreamManager::open(Arc::new(MemorySource::new(data)), &options, diagnostics.clone())
                .await?;
        ObjectStore::open(manager, FilterRegistry::with_builtins(), &options, diagnostics).await
    }

    #[tokio::test]
    async fn test_fetch_and_cache() {
        let data = build_pdf(
            &[catalog(), (2, b"<< /Type /Pages /Kids [] /Count 0 >>")],
            "/Root 1 0 R",
        );
        let store = open(data).await.unwrap();

        let pages = store.fetch(Ref::new(2, 0)).await.unwrap();
        assert_eq!(pages.type_name(), Some("Pages"));
        let parses = store.stats().object_parses;

        let again = store.fetch(Ref::new(2, 0)).await.unwrap();
        assert!(Arc::ptr_eq(&pages, &again));
        assert_eq!(store.stats().object_parses, parses);
        assert!(store.stats().cache_hits >= 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_parse_once() {
        let data = build_pdf(&[catalog(), (2, b"<< /Big true >>")], "/Root 1 0 R");
        let store = open(data).await.unwrap();
        let before = store.stats().object_parses;

        let (a, b) = tokio::join!(store.fetch(Ref::new(2, 0)), store.fetch(Ref::new(2, 0)));
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(store.stats().object_parses, before + 1);
    }

    #[tokio::test]
    async fn test_missing_objects_resolve_to_null() {
        let mut data = build_pdf(&[catalog(), (2, b"(kept)")], "/Root 1 0 R");
        // point object 2 past the end of the file
        let text = String::from_utf8_lossy(&data).into_owned();
        let entry = text.lines().filter(|l| l.ends_with(" n ")).nth(1).unwrap().to_string();
        let pos = text.find(&entry).unwrap();
        data[pos..pos + 10].copy_from_slice(b"0000099999");
        let store = open(data).await.unwrap();

        assert!(store.fetch(Ref::new(2, 0)).await.unwrap().is_null());
        assert!(store.fetch(Ref::new(40, 0)).await.unwrap().is_null());
        assert!(store.fetch(Ref::new(1, 3)).await.unwrap().is_null());
        assert_eq!(store.diagnostics().count(WarningKind::MissingObject), 3);
        assert!(store.fetch(Ref::new(1, 0)).await.unwrap().as_dict().is_some());
    }

    #[tokio::test]
    async fn test_indirect_length() {
        let data = build_pdf(
            &[
                catalog(),
                (3, b"<< /Length 4 0 R >>\nstream\nhello world\nendstream"),
                (4, b"11"),
            ],
            "/Root 1 0 R",
        );
        let store = open(data).await.unwrap();
        let bytes = store.get_stream_bytes(Ref::new(3, 0)).await.unwrap();
        assert_eq!(&bytes[..], b"hello world");

        // second decode comes from the cache
        let hits = store.stats().cache_hits;
        store.get_stream_bytes(Ref::new(3, 0)).await.unwrap();
        assert_eq!(store.stats().cache_hits, hits + 1);
    }

    #[tokio::test]
    async fn test_non_stream_decodes_to_empty() {
        let data = build_pdf(&[catalog()], "/Root 1 0 R");
        let store = open(data).await.unwrap();
        let bytes = store.get_stream_bytes(Ref::new(1, 0)).await.unwrap();
        assert!(bytes.is_empty());
        assert!(store.diagnostics().has(WarningKind::MalformedObject));
    }

    #[tokio::test]
    async fn test_shifted_offset_is_repaired() {
        let mut data = build_pdf(&[catalog(), (2, b"(moved)")], "/Root 1 0 R");
        // insert padding before object 2 without updating the table
        let at = data.windows(7).position(|w| w == b"2 0 obj").unwrap();
        data.splice(at..at, b"junk junk\n".iter().copied());
        let fixed_startxref = {
            let text = String::from_utf8_lossy(&data).into_owned();
            let xref_at = text.find("xref\n").unwrap();
            let tail = text.rfind("startxref\n").unwrap() + "startxref\n".len();
            let end = text[tail..].find('\n').unwrap() + tail;
            let mut fixed = data[..tail].to_vec();
            fixed.extend_from_slice(xref_at.to_string().as_bytes());
            fixed.extend_from_slice(&data[end..]);
            fixed
        };
        let store = open(fixed_startxref).await.unwrap();

        let object = store.fetch(Ref::new(2, 0)).await.unwrap();
        assert_eq!(object.as_bytes(), Some(&b"moved"[..]));
        assert!(store.diagnostics().has(WarningKind::MalformedObject));
    }

    #[tokio::test]
    async fn test_resolve_deep_stops_at_cycles() {
        let data = build_pdf(
            &[catalog(), (2, b"<< /Self 2 0 R /Child 3 0 R >>"), (3, b"[1 2 3]")],
            "/Root 1 0 R",
        );
        let store = open(data).await.unwrap();

        let resolved = store.resolve_deep(PDFObject::Ref(Ref::new(2, 0)), 8).await.unwrap();
        let dict = resolved.as_dict().unwrap();
        assert_eq!(dict.get("Self"), Some(&PDFObject::Ref(Ref::new(2, 0))));
        assert_eq!(dict.get("Child").and_then(PDFObject::as_array).map(<[_]>::len), Some(3));
    }

    #[tokio::test]
    async fn test_empty_and_garbage_input() {
        assert!(matches!(open(Vec::new()).await, Err(PDFError::InvalidDocument(_))));
        assert!(matches!(
            open(b"this is not a pdf at all".to_vec()).await,
            Err(PDFError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_trailer_is_reconstructed() {
        let data = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n2 0 obj\n<< /Type /Pages /Kids [] /Count 0 >>\nendobj\n".to_vec();
        let store = open(data).await.unwrap();
        assert!(store.xref().unwrap().is_repaired());
        assert_eq!(store.root().unwrap(), Ref::new(1, 0));
        assert!(store.diagnostics().has(WarningKind::XRefRepaired));
    }

    #[test]
    fn test_parse_object_stream() {
        let data = Bytes::from_static(b"7 0 8 4 (a) [1 2]");
        let objects = parse_object_stream(&data, 2, 8).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].0, 7);
        assert_eq!(objects[0].1.as_bytes(), Some(&b"a"[..]));
        assert_eq!(objects[1].1.as_array().map(<[_]>::len), Some(2));
        assert!(parse_object_stream(&data, 2, 100).is_err());
    }

    #[test]
    fn test_object_stream_member_offset_overflow() {
        let data = Bytes::from_static(b"7 99999999999999999999999 8 0 (a)");
        let objects = parse_object_stream(&data, 2, 30).unwrap();
        assert_eq!(objects.len(), 2);
        assert!(objects[0].1.is_null());
        assert_eq!(objects[1].1.as_bytes(), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn test_length_dependency_joins_fetch_in_flight() {
        let data = build_pdf(
            &[
                catalog(),
                (3, b"<< /Length 4 0 R >>\nstream\nhello world\nendstream"),
                (4, b"11"),
            ],
            "/Root 1 0 R",
        );
        let store = open(data).await.unwrap();
        let before = store.stats().object_parses;

        let (stream, length) = tokio::join!(store.fetch(Ref::new(3, 0)), store.fetch(Ref::new(4, 0)));
        assert_eq!(&stream.unwrap().as_stream().unwrap().raw[..], b"hello world");
        assert_eq!(length.unwrap().as_number(), Some(11.0));
        // one parse each, whichever fetch reached object 4 first
        assert_eq!(store.stats().object_parses, before + 2);
    }

    #[tokio::test]
    async fn test_lengths_naming_each_other_do_not_hang() {
        let data = build_pdf(
            &[
                catalog(),
                (3, b"<< /Length 4 0 R >>\nstream\nthree\nendstream"),
                (4, b"<< /Length 3 0 R >>\nstream\nfour\nendstream"),
            ],
            "/Root 1 0 R",
        );
        let store = open(data).await.unwrap();

        let both = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            async { tokio::join!(store.fetch(Ref::new(3, 0)), store.fetch(Ref::new(4, 0))) },
        )
        .await
        .unwrap();
        assert_eq!(&both.0.unwrap().as_stream().unwrap().raw[..], b"three");
        assert_eq!(&both.1.unwrap().as_stream().unwrap().raw[..], b"four");
    }
}
