//! A document served over a [`MessageHandler`].
//!
//! [`WorkerHost`] owns one [`PDFDocument`] and answers `open`, `get_page`,
//! `get_operator_list` and `terminate` requests. [`WorkerDocument`] is the
//! client side. The host can run as a task on the caller's runtime
//! ([`spawn_local_worker`]) or on a thread of its own with a private
//! runtime ([`spawn_thread_worker`]); either way the two sides share
//! nothing but messages.

use super::byte_source::ProgressData;
use super::config::LoadOptions;
use super::content_stream::OperatorList;
use super::document::PDFDocument;
use super::encryption::Permissions;
use super::error::{PDFError, PDFResult};
use super::message_handler::{MessageHandler, ProgressSink, Request, Transport};
use super::page::PageInfo;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

pub const ACTION_OPEN: &str = "open";
pub const ACTION_GET_PAGE: &str = "get_page";
pub const ACTION_GET_OPERATOR_LIST: &str = "get_operator_list";
pub const ACTION_TERMINATE: &str = "terminate";

/// How long `run` waits for outstanding replies after `terminate`.
const REPLY_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Where the host reads the document from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpenSource {
    Data(Vec<u8>),
    Path(String),
    Url(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenParams {
    pub source: Option<OpenSource>,
    pub password: Option<String>,
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub disable_range: bool,
}

impl OpenParams {
    pub fn new(source: OpenSource) -> Self {
        OpenParams {
            source: Some(source),
            ..Default::default()
        }
    }

    fn load_options(&self) -> LoadOptions {
        let mut options = LoadOptions::default().with_disable_range(self.disable_range);
        if let Some(password) = &self.password {
            options = options.with_password(password);
        }
        if let Some(chunk_size) = self.chunk_size {
            options = options.with_chunk_size(chunk_size);
        }
        options
    }
}

/// Reply to `open`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub page_count: usize,
    pub revisions: usize,
    pub encrypted: bool,
    pub permissions: Option<Permissions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct PageRequest {
    index: usize,
}

/// Serves one document over a transport.
pub struct WorkerHost {
    handler: MessageHandler,
    terminated: Arc<Notify>,
}

type Slot = Arc<Mutex<Option<PDFDocument>>>;

impl WorkerHost {
    pub fn new(transport: Transport) -> Self {
        let handler = MessageHandler::new("worker", transport);
        let slot: Slot = Arc::new(Mutex::new(None));
        let terminated = Arc::new(Notify::new());

        let open_slot = Arc::clone(&slot);
        handler.on(ACTION_OPEN, move |payload, progress| {
            let slot = Arc::clone(&open_slot);
            async move { open(slot, payload, progress).await }
        });

        let page_slot = Arc::clone(&slot);
        handler.on(ACTION_GET_PAGE, move |payload, _| {
            let slot = Arc::clone(&page_slot);
            async move {
                let request: PageRequest = serde_json::from_value(payload)?;
                let page = document(&slot)?.get_page(request.index).await?;
                Ok(serde_json::to_value(page.info())?)
            }
        });

        let list_slot = Arc::clone(&slot);
        handler.on(ACTION_GET_OPERATOR_LIST, move |payload, _| {
            let slot = Arc::clone(&list_slot);
            async move {
                let request: PageRequest = serde_json::from_value(payload)?;
                let list = document(&slot)?.operator_list(request.index).await?;
                Ok(serde_json::to_value(&*list)?)
            }
        });

        let terminate_slot = Arc::clone(&slot);
        let notify = Arc::clone(&terminated);
        handler.on(ACTION_TERMINATE, move |_, _| {
            let slot = Arc::clone(&terminate_slot);
            let notify = Arc::clone(&notify);
            async move {
                if let Some(document) = lock(&slot).take() {
                    document.cancel("worker terminated");
                }
                notify.notify_one();
                Ok(Value::Null)
            }
        });

        WorkerHost {
            handler,
            terminated,
        }
    }

    pub fn handler(&self) -> &MessageHandler {
        &self.handler
    }

    /// Serves requests until `terminate` is received.
    pub async fn run(self) {
        self.terminated.notified().await;
        // Replies (terminate's own included) go out before the runtime stops.
        if tokio::time::timeout(REPLY_DRAIN_TIMEOUT, self.handler.drained())
            .await
            .is_err()
        {
            warn!(
                "Worker terminated with {} request(s) unanswered",
                self.handler.running_requests()
            );
            return;
        }
        info!("Worker terminated");
    }
}

async fn open(slot: Slot, payload: Value, progress: ProgressSink) -> PDFResult<Value> {
    let params: OpenParams = serde_json::from_value(payload)?;
    let source = params
        .source
        .clone()
        .ok_or_else(|| PDFError::MissingDocument("open request without a source".to_string()))?;

    let mut options = params.load_options();
    options = options.with_progress(Arc::new(move |data: ProgressData| {
        progress.send(serde_json::to_value(data).unwrap_or(Value::Null));
    }));

    let document = match source {
        OpenSource::Data(data) => PDFDocument::open(data, options).await?,
        OpenSource::Path(path) => PDFDocument::open_file(path, options).await?,
        #[cfg(feature = "network")]
        OpenSource::Url(url) => PDFDocument::open_url(url, options).await?,
        #[cfg(not(feature = "network"))]
        OpenSource::Url(url) => {
            return Err(PDFError::Unreachable(format!(
                "{}: built without network support",
                url
            )));
        }
    };

    let info = DocumentInfo {
        page_count: document.page_count(),
        revisions: document.revision_count(),
        encrypted: document.is_encrypted(),
        permissions: document.permissions(),
    };
    if let Some(previous) = lock(&slot).replace(document) {
        previous.cancel("replaced by a new document");
    }
    Ok(serde_json::to_value(info)?)
}

fn document(slot: &Slot) -> PDFResult<PDFDocument> {
    lock(slot)
        .clone()
        .ok_or_else(|| PDFError::MissingDocument("no document is open".to_string()))
}

fn lock(slot: &Slot) -> std::sync::MutexGuard<'_, Option<PDFDocument>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client view of a document served by a [`WorkerHost`].
pub struct WorkerDocument {
    handler: MessageHandler,
    info: DocumentInfo,
}

impl WorkerDocument {
    /// Asks the host to open a document.
    pub async fn open(handler: MessageHandler, params: OpenParams) -> PDFResult<Self> {
        Self::open_with_progress(handler, params, |_| {}).await
    }

    /// Like [`open`](Self::open), calling `on_progress` for every progress
    /// message the host forwards while loading.
    pub async fn open_with_progress(
        handler: MessageHandler,
        params: OpenParams,
        mut on_progress: impl FnMut(ProgressData),
    ) -> PDFResult<Self> {
        let mut request = handler.request(ACTION_OPEN, serde_json::to_value(params)?);
        while let Some(update) = request.progress().await {
            if let Ok(data) = serde_json::from_value(update) {
                on_progress(data);
            }
        }
        let info = serde_json::from_value(request.response().await?)?;
        Ok(WorkerDocument { handler, info })
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn page_count(&self) -> usize {
        self.info.page_count
    }

    pub async fn get_page(&self, index: usize) -> PDFResult<PageInfo> {
        let reply = self
            .handler
            .send_with_reply(ACTION_GET_PAGE, serde_json::to_value(PageRequest { index })?)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn get_operator_list(&self, index: usize) -> PDFResult<OperatorList> {
        let reply = self.request_operator_list(index)?.response().await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Starts compiling page `index`; the request can be cancelled.
    pub fn request_operator_list(&self, index: usize) -> PDFResult<Request> {
        Ok(self.handler.request(
            ACTION_GET_OPERATOR_LIST,
            serde_json::to_value(PageRequest { index })?,
        ))
    }

    /// Stops the host.
    pub async fn terminate(self) -> PDFResult<()> {
        self.handler
            .send_with_reply(ACTION_TERMINATE, Value::Null)
            .await
            .map(|_| ())
    }
}

/// Runs a host as a task on the current runtime and returns the client end.
pub fn spawn_local_worker() -> MessageHandler {
    let (client, host) = Transport::pair();
    let host = WorkerHost::new(host);
    tokio::spawn(host.run());
    MessageHandler::new("main", client)
}

/// A host running on its own OS thread.
pub struct WorkerThread {
    pub handler: MessageHandler,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WorkerThread {
    /// Waits for the thread to exit (after `terminate`).
    pub fn join(mut self) -> PDFResult<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| PDFError::Generic("worker thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

/// Starts a host on a new thread with its own Tokio runtime. The returned
/// handler lives on the caller's runtime.
pub fn spawn_thread_worker() -> PDFResult<WorkerThread> {
    let (client, host) = Transport::pair();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("pdf-worker")
        .enable_all()
        .build()?;

    let thread = std::thread::Builder::new()
        .name("pdf-worker-host".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                WorkerHost::new(host).run().await;
            });
        })
        .map_err(|e| {
            error!("Failed to start worker thread: {}", e);
            PDFError::Generic(format!("failed to start worker thread: {}", e))
        })?;

    Ok(WorkerThread {
        handler: MessageHandler::new("main", client),
        thread: Some(thread),
    })
}
